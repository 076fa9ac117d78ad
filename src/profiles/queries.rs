/*
Copyright 2021 Jakub Lewandowski

This file is part of EM27 Retrieval Pipeline.

EM27 Retrieval Pipeline is a free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 3 of the License, or
(at your option) any later version.

EM27 Retrieval Pipeline is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with EM27 Retrieval Pipeline. If not, see https://www.gnu.org/licenses/.
*/

//! Computation of the profile requests still to be made.
//!
//! Profiles are requested per rounded location (whole degrees) and
//! per contiguous date range. A date counts as downloaded only when
//! all files of the model are present.

use crate::{
    configuration::{AtmosphericProfileModel, ProfilesScopeConfig, StandardSiteConfig},
    constants::{GGG2020_HOURS, PROFILES_REQUEST_DELAY_HOURS},
    metadata::MetadataStore,
    utils,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fs, io, path::Path};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Debug, Deserialize, Serialize)]
pub struct ProfilesLocation {
    pub lat: i32,
    pub lon: i32,
}

impl ProfilesLocation {
    pub fn from_coordinates(lat: f64, lon: f64) -> Self {
        ProfilesLocation {
            lat: lat.round() as i32,
            lon: lon.round() as i32,
        }
    }

    pub fn slug(&self) -> String {
        utils::coordinates_slug(self.lat, self.lon)
    }
}

#[derive(Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
pub struct DownloadQuery {
    pub lat: i32,
    pub lon: i32,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
}

impl DownloadQuery {
    pub fn location(&self) -> ProfilesLocation {
        ProfilesLocation {
            lat: self.lat,
            lon: self.lon,
        }
    }
}

pub type DatesPerLocation = FxHashMap<ProfilesLocation, BTreeSet<NaiveDate>>;

/// Dates within scope for which the complete set of
/// profile files exists in `profiles_dir`.
pub fn list_downloaded_data(
    profiles_dir: &Path,
    model: AtmosphericProfileModel,
    scope: &ProfilesScopeConfig,
) -> io::Result<DatesPerLocation> {
    let mut downloaded = DatesPerLocation::default();
    if !profiles_dir.is_dir() {
        return Ok(downloaded);
    }

    let pattern = Regex::new(r"^(\d{8})(\d{2})?_(\d{2})(N|S)(\d{3})(E|W)\.(map|mod|vmr)$")
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    let mut filenames = FxHashSet::default();
    let mut candidates: FxHashSet<(ProfilesLocation, NaiveDate)> = FxHashSet::default();

    for entry in fs::read_dir(profiles_dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        let captures = match pattern.captures(&name) {
            Some(captures) => captures,
            None => continue,
        };

        let date = match NaiveDate::parse_from_str(&captures[1], "%Y%m%d") {
            Ok(date) => date,
            Err(_) => continue,
        };
        let lat: i32 = captures[3].parse().unwrap_or_default();
        let lon: i32 = captures[5].parse().unwrap_or_default();
        let location = ProfilesLocation {
            lat: if &captures[4] == "S" { -lat } else { lat },
            lon: if &captures[6] == "W" { -lon } else { lon },
        };

        if scope.from_date <= date && date <= scope.to_date {
            candidates.insert((location, date));
        }
        filenames.insert(name);
    }

    for (location, date) in candidates {
        let complete = expected_filenames(model, location, date)
            .iter()
            .all(|name| filenames.contains(name));
        if complete {
            downloaded.entry(location).or_default().insert(date);
        }
    }

    Ok(downloaded)
}

/// Names of all files making up the profiles of one location and date.
pub fn expected_filenames(
    model: AtmosphericProfileModel,
    location: ProfilesLocation,
    date: NaiveDate,
) -> Vec<String> {
    let slug = location.slug();
    let date_string = utils::date_string(date);

    match model {
        AtmosphericProfileModel::GGG2014 => ["map", "mod"]
            .iter()
            .map(|ext| format!("{}_{}.{}", date_string, slug, ext))
            .collect(),
        AtmosphericProfileModel::GGG2020 => GGG2020_HOURS
            .iter()
            .flat_map(|hour| {
                let prefix = format!("{}{:02}", date_string, hour);
                let slug = slug.clone();
                ["map", "mod", "vmr"]
                    .iter()
                    .map(move |ext| format!("{}_{}.{}", prefix, slug, ext))
            })
            .collect(),
    }
}

/// Dates within scope at which any sensor stood at a location.
/// Dates closer than 12 hours to `now` are never requested.
pub fn list_requested_data(
    metadata: &MetadataStore,
    scope: &ProfilesScopeConfig,
    now: DateTime<Utc>,
) -> DatesPerLocation {
    let mut requested = DatesPerLocation::default();
    let latest_date = (now - Duration::hours(PROFILES_REQUEST_DELAY_HOURS)).date_naive();

    for sensor in &metadata.sensors {
        for period in &sensor.locations {
            let location = match metadata.location(&period.location_id) {
                Some(location) => ProfilesLocation::from_coordinates(location.lat, location.lon),
                None => continue,
            };

            let from_date = scope.from_date.max(period.from_datetime.date_naive());
            let to_date = scope
                .to_date
                .min(period.to_datetime.date_naive())
                .min(latest_date);

            let dates = requested.entry(location).or_default();
            dates.extend(utils::date_range(from_date, to_date));
        }
    }

    requested
}

pub fn compute_missing_data(requested: DatesPerLocation, downloaded: &DatesPerLocation) -> DatesPerLocation {
    requested
        .into_iter()
        .map(|(location, dates)| match downloaded.get(&location) {
            Some(done) => (location, dates.difference(done).copied().collect()),
            None => (location, dates),
        })
        .filter(|(_, dates): &(ProfilesLocation, BTreeSet<NaiveDate>)| !dates.is_empty())
        .collect()
}

/// Drops dates covered by requests that are still pending.
pub fn remove_already_requested_data(missing: &mut DatesPerLocation, active_queries: &[DownloadQuery]) {
    for query in active_queries {
        if let Some(dates) = missing.get_mut(&query.location()) {
            for date in utils::date_range(query.from_date, query.to_date) {
                dates.remove(&date);
            }
        }
    }
    missing.retain(|_, dates| !dates.is_empty());
}

/// Drops dates for which the profile service produces
/// profiles at the standard sites anyway.
pub fn remove_standard_site_data(missing: &mut DatesPerLocation, sites: &[StandardSiteConfig]) {
    for site in sites {
        let location = ProfilesLocation::from_coordinates(site.lat, site.lon);
        if let Some(dates) = missing.get_mut(&location) {
            for date in utils::date_range(site.from_date, site.to_date) {
                dates.remove(&date);
            }
        }
    }
    missing.retain(|_, dates| !dates.is_empty());
}

/// Splits the dates into runs of consecutive days,
/// each at most `max_days` long.
pub fn compute_time_periods(dates: &BTreeSet<NaiveDate>, max_days: u16) -> Vec<(NaiveDate, NaiveDate)> {
    let max_days = i64::from(max_days.max(1));
    let mut periods: Vec<(NaiveDate, NaiveDate)> = vec![];

    for date in dates {
        if let Some((from_date, to_date)) = periods.last_mut() {
            if *date == *to_date + Duration::days(1) && (*date - *from_date).num_days() < max_days {
                *to_date = *date;
                continue;
            }
        }
        periods.push((*date, *date));
    }

    periods
}

/// All queries needed to complete the profiles of the given model,
/// ordered by their start date.
pub fn generate_download_queries(
    profiles_dir: &Path,
    model: AtmosphericProfileModel,
    scope: &ProfilesScopeConfig,
    standard_sites: &[StandardSiteConfig],
    metadata: &MetadataStore,
    active_queries: &[DownloadQuery],
    now: DateTime<Utc>,
) -> io::Result<Vec<DownloadQuery>> {
    let downloaded = list_downloaded_data(profiles_dir, model, scope)?;
    let requested = list_requested_data(metadata, scope, now);

    let mut missing = compute_missing_data(requested, &downloaded);
    remove_already_requested_data(&mut missing, active_queries);
    if model == AtmosphericProfileModel::GGG2020 {
        remove_standard_site_data(&mut missing, standard_sites);
    }

    let mut queries: Vec<DownloadQuery> = missing
        .iter()
        .flat_map(|(location, dates)| {
            compute_time_periods(dates, scope.max_days_per_query)
                .into_iter()
                .map(move |(from_date, to_date)| DownloadQuery {
                    lat: location.lat,
                    lon: location.lon,
                    from_date,
                    to_date,
                })
        })
        .collect();

    queries.sort_by_key(|q| (q.from_date, q.lat, q.lon));
    Ok(queries)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metadata::tests::{datetime, location, sensor};

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2000, m, d).unwrap()
    }

    pub(crate) fn scope() -> ProfilesScopeConfig {
        ProfilesScopeConfig {
            from_date: date(1, 1),
            to_date: date(5, 30),
            models: vec![AtmosphericProfileModel::GGG2014, AtmosphericProfileModel::GGG2020],
            max_days_per_query: 28,
        }
    }

    pub(crate) fn metadata() -> MetadataStore {
        MetadataStore::new(
            vec![
                location("l1", 1.0, 2.0),
                location("l2", 1.0, 3.0),
                location("l3", 2.0, 3.0),
            ],
            vec![
                sensor(
                    "s1",
                    1,
                    &[
                        ("2000-01-01T00:00:00+00:00", "2000-03-01T11:59:59+00:00", "l1"),
                        ("2000-03-01T12:00:00+00:00", "2000-05-01T23:59:59+00:00", "l3"),
                        ("2000-05-04T12:00:00+00:00", "2000-05-07T23:59:59+00:00", "l2"),
                    ],
                ),
                sensor(
                    "s2",
                    2,
                    &[
                        ("2000-01-07T00:00:00+00:00", "2000-02-23T23:59:59+00:00", "l1"),
                        ("2000-05-05T12:00:00+00:00", "2000-05-08T23:59:59+00:00", "l2"),
                    ],
                ),
            ],
            vec![],
        )
        .unwrap()
    }

    fn query(lat: i32, lon: i32, from: (u32, u32), to: (u32, u32)) -> DownloadQuery {
        DownloadQuery {
            lat,
            lon,
            from_date: date(from.0, from.1),
            to_date: date(to.0, to.1),
        }
    }

    #[test]
    fn query_generation() {
        let dir = tempfile::tempdir().unwrap();
        let now = datetime("2000-07-01T00:00:00+00:00");

        for model in [AtmosphericProfileModel::GGG2014, AtmosphericProfileModel::GGG2020] {
            let queries =
                generate_download_queries(dir.path(), model, &scope(), &[], &metadata(), &[], now).unwrap();

            assert_eq!(
                queries,
                vec![
                    query(1, 2, (1, 1), (1, 28)),
                    query(1, 2, (1, 29), (2, 25)),
                    query(1, 2, (2, 26), (3, 1)),
                    query(2, 3, (3, 1), (3, 28)),
                    query(2, 3, (3, 29), (4, 25)),
                    query(2, 3, (4, 26), (5, 1)),
                    query(1, 3, (5, 4), (5, 8)),
                ]
            );
        }
    }

    #[test]
    fn downloaded_pending_and_recent_dates_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let l2 = ProfilesLocation { lat: 1, lon: 3 };

        // complete set for 05-04, incomplete for 05-05
        for name in expected_filenames(AtmosphericProfileModel::GGG2014, l2, date(5, 4)) {
            fs::write(dir.path().join(name), "").unwrap();
        }
        fs::write(dir.path().join("20000505_01N003E.map"), "").unwrap();

        let downloaded = list_downloaded_data(dir.path(), AtmosphericProfileModel::GGG2014, &scope()).unwrap();
        assert_eq!(downloaded.len(), 1);
        assert_eq!(downloaded[&l2], BTreeSet::from([date(5, 4)]));

        let pending = [query(2, 3, (3, 1), (4, 30))];
        // latest requested date is 2000-05-06
        let now = datetime("2000-05-07T00:00:00+00:00");
        let queries = generate_download_queries(
            dir.path(),
            AtmosphericProfileModel::GGG2014,
            &scope(),
            &[],
            &metadata(),
            &pending,
            now,
        )
        .unwrap();

        assert!(queries.contains(&query(2, 3, (5, 1), (5, 1))));
        assert!(queries.contains(&query(1, 3, (5, 5), (5, 6))));
        assert!(!queries.iter().any(|q| q.to_date > date(5, 6)));
    }

    #[test]
    fn standard_sites_only_for_ggg2020() {
        let dir = tempfile::tempdir().unwrap();
        let now = datetime("2000-07-01T00:00:00+00:00");
        let sites = [StandardSiteConfig {
            identifier: "xx".to_string(),
            lat: 1.2,
            lon: 2.8,
            from_date: date(1, 1),
            to_date: date(12, 31),
        }];

        let ggg2020 = generate_download_queries(
            dir.path(),
            AtmosphericProfileModel::GGG2020,
            &scope(),
            &sites,
            &metadata(),
            &[],
            now,
        )
        .unwrap();
        assert!(!ggg2020.iter().any(|q| q.lat == 1 && q.lon == 3));
        assert_eq!(ggg2020.len(), 6);

        let ggg2014 = generate_download_queries(
            dir.path(),
            AtmosphericProfileModel::GGG2014,
            &scope(),
            &sites,
            &metadata(),
            &[],
            now,
        )
        .unwrap();
        assert_eq!(ggg2014.len(), 7);
    }

    #[test]
    fn time_periods() {
        let dates: BTreeSet<NaiveDate> = [date(1, 1), date(1, 2), date(1, 3), date(1, 5), date(1, 6)]
            .into_iter()
            .collect();

        assert_eq!(
            compute_time_periods(&dates, 2),
            vec![
                (date(1, 1), date(1, 2)),
                (date(1, 3), date(1, 3)),
                (date(1, 5), date(1, 6)),
            ]
        );
    }
}
