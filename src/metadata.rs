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

//! Module holding the sensor, location and campaign metadata.
//!
//! The metadata is read from three JSON files (`locations.json`,
//! `sensors.json` and `campaigns.json`) stored in one directory. It tells
//! the pipeline where each sensor was standing at which time, which is
//! needed to pick the correct atmospheric profiles and to group the
//! sensors into campaigns when exporting.

use crate::errors::MetadataError;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use log::debug;
use rustc_hash::FxHashSet;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct LocationMetadata {
    pub location_id: String,
    pub details: String,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

/// A period during which a sensor was standing at one location.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct SensorLocation {
    pub from_datetime: DateTime<Utc>,
    pub to_datetime: DateTime<Utc>,
    pub location_id: String,
}

/// A period with a constant offset of the sensor clock to UTC (in hours).
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct SensorUtcOffset {
    pub from_datetime: DateTime<Utc>,
    pub to_datetime: DateTime<Utc>,
    pub utc_offset: f64,
}

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct SensorMetadata {
    pub sensor_id: String,
    pub serial_number: u32,
    pub locations: Vec<SensorLocation>,

    #[serde(default)]
    pub utc_offsets: Vec<SensorUtcOffset>,

    /// Sensor whose datalogger provides the ground pressure.
    /// Defaults to the sensor itself.
    #[serde(default)]
    pub pressure_data_source: Option<String>,
}

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct CampaignMetadata {
    pub campaign_id: String,
    pub from_datetime: DateTime<Utc>,
    pub to_datetime: DateTime<Utc>,
    pub sensor_ids: Vec<String>,
    pub location_ids: Vec<String>,
}

/// Everything known about one sensor during one uninterrupted
/// period within a single day.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct SensorDataContext {
    pub sensor_id: String,
    pub serial_number: u32,
    pub utc_offset: f64,
    pub pressure_data_source: String,
    pub location: LocationMetadata,
    pub from_datetime: DateTime<Utc>,
    pub to_datetime: DateTime<Utc>,
}

impl SensorDataContext {
    pub fn date(&self) -> NaiveDate {
        self.from_datetime.date_naive()
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct MetadataStore {
    pub locations: Vec<LocationMetadata>,
    pub sensors: Vec<SensorMetadata>,
    pub campaigns: Vec<CampaignMetadata>,
}

impl MetadataStore {
    /// Reads and checks the metadata files in `dir`.
    pub fn load(dir: &Path) -> Result<Self, MetadataError> {
        debug!("Reading metadata from {}", dir.display());

        let store = MetadataStore::new(
            read_json(&dir.join("locations.json"))?,
            read_json(&dir.join("sensors.json"))?,
            read_json(&dir.join("campaigns.json"))?,
        )?;

        debug!(
            "Metadata contains {} locations, {} sensors and {} campaigns",
            store.locations.len(),
            store.sensors.len(),
            store.campaigns.len()
        );

        Ok(store)
    }

    pub fn new(
        locations: Vec<LocationMetadata>,
        sensors: Vec<SensorMetadata>,
        campaigns: Vec<CampaignMetadata>,
    ) -> Result<Self, MetadataError> {
        let store = MetadataStore {
            locations,
            sensors,
            campaigns,
        };
        store.check_integrity()?;
        Ok(store)
    }

    fn check_integrity(&self) -> Result<(), MetadataError> {
        let location_ids: FxHashSet<&str> = self
            .locations
            .iter()
            .map(|l| l.location_id.as_str())
            .collect();
        let sensor_ids: FxHashSet<&str> =
            self.sensors.iter().map(|s| s.sensor_id.as_str()).collect();

        if location_ids.len() != self.locations.len() {
            return Err(MetadataError::Inconsistent(
                "location ids are not unique".to_string(),
            ));
        }
        if sensor_ids.len() != self.sensors.len() {
            return Err(MetadataError::Inconsistent(
                "sensor ids are not unique".to_string(),
            ));
        }

        for sensor in &self.sensors {
            let mut periods: Vec<(DateTime<Utc>, DateTime<Utc>)> = vec![];

            for location in &sensor.locations {
                if !location_ids.contains(location.location_id.as_str()) {
                    return Err(MetadataError::Inconsistent(format!(
                        "sensor {} uses unknown location {}",
                        sensor.sensor_id, location.location_id
                    )));
                }
                if location.from_datetime > location.to_datetime {
                    return Err(MetadataError::Inconsistent(format!(
                        "sensor {} has a location period ending before it starts",
                        sensor.sensor_id
                    )));
                }
                periods.push((location.from_datetime, location.to_datetime));
            }

            periods.sort();
            if periods.windows(2).any(|w| w[1].0 <= w[0].1) {
                return Err(MetadataError::Inconsistent(format!(
                    "sensor {} has overlapping location periods",
                    sensor.sensor_id
                )));
            }

            if let Some(source) = &sensor.pressure_data_source {
                if !sensor_ids.contains(source.as_str()) {
                    return Err(MetadataError::Inconsistent(format!(
                        "sensor {} uses unknown pressure data source {}",
                        sensor.sensor_id, source
                    )));
                }
            }
        }

        for campaign in &self.campaigns {
            if campaign.from_datetime > campaign.to_datetime {
                return Err(MetadataError::Inconsistent(format!(
                    "campaign {} ends before it starts",
                    campaign.campaign_id
                )));
            }
            if let Some(sid) = campaign
                .sensor_ids
                .iter()
                .find(|sid| !sensor_ids.contains(sid.as_str()))
            {
                return Err(MetadataError::Inconsistent(format!(
                    "campaign {} uses unknown sensor {}",
                    campaign.campaign_id, sid
                )));
            }
            if let Some(lid) = campaign
                .location_ids
                .iter()
                .find(|lid| !location_ids.contains(lid.as_str()))
            {
                return Err(MetadataError::Inconsistent(format!(
                    "campaign {} uses unknown location {}",
                    campaign.campaign_id, lid
                )));
            }
        }

        Ok(())
    }

    pub fn sensor(&self, sensor_id: &str) -> Result<&SensorMetadata, MetadataError> {
        self.sensors
            .iter()
            .find(|s| s.sensor_id == sensor_id)
            .ok_or_else(|| MetadataError::UnknownSensor(sensor_id.to_string()))
    }

    pub fn location(&self, location_id: &str) -> Option<&LocationMetadata> {
        self.locations.iter().find(|l| l.location_id == location_id)
    }

    pub fn campaign(&self, campaign_id: &str) -> Result<&CampaignMetadata, MetadataError> {
        self.campaigns
            .iter()
            .find(|c| c.campaign_id == campaign_id)
            .ok_or_else(|| MetadataError::UnknownCampaign(campaign_id.to_string()))
    }

    /// All contexts of the sensor on the given UTC date,
    /// clipped to that date and ordered by time.
    pub fn get(
        &self,
        sensor_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<SensorDataContext>, MetadataError> {
        let sensor = self.sensor(sensor_id)?;

        let day_start = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
        let day_end = day_start + Duration::days(1) - Duration::seconds(1);

        let mut contexts = vec![];

        for period in &sensor.locations {
            if period.to_datetime < day_start || period.from_datetime > day_end {
                continue;
            }

            let location = self.location(&period.location_id).ok_or_else(|| {
                MetadataError::Inconsistent(format!("unknown location {}", period.location_id))
            })?;

            let from_datetime = period.from_datetime.max(day_start);
            let utc_offset = sensor
                .utc_offsets
                .iter()
                .find(|o| o.from_datetime <= from_datetime && from_datetime <= o.to_datetime)
                .map_or(0.0, |o| o.utc_offset);

            contexts.push(SensorDataContext {
                sensor_id: sensor.sensor_id.clone(),
                serial_number: sensor.serial_number,
                utc_offset,
                pressure_data_source: sensor
                    .pressure_data_source
                    .clone()
                    .unwrap_or_else(|| sensor.sensor_id.clone()),
                location: location.clone(),
                from_datetime,
                to_datetime: period.to_datetime.min(day_end),
            });
        }

        contexts.sort_by_key(|c| c.from_datetime);
        Ok(contexts)
    }

    /// The only context of the sensor on the given date.
    pub fn get_single(
        &self,
        sensor_id: &str,
        date: NaiveDate,
    ) -> Result<SensorDataContext, MetadataError> {
        let mut contexts = self.get(sensor_id, date)?;

        match contexts.len() {
            0 => Err(MetadataError::NoLocationData(sensor_id.to_string(), date)),
            1 => Ok(contexts.remove(0)),
            _ => Err(MetadataError::MultipleLocations(sensor_id.to_string(), date)),
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, MetadataError> {
    let data =
        fs::read(path).map_err(|err| MetadataError::CantOpenFile(path.to_path_buf(), err))?;
    serde_json::from_slice(&data)
        .map_err(|err| MetadataError::CantDeserialize(path.to_path_buf(), err))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn datetime(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    pub(crate) fn location(id: &str, lat: f64, lon: f64) -> LocationMetadata {
        LocationMetadata {
            location_id: id.to_string(),
            details: format!("{} details", id),
            lat,
            lon,
            alt: 0.0,
        }
    }

    pub(crate) fn sensor(id: &str, serial_number: u32, periods: &[(&str, &str, &str)]) -> SensorMetadata {
        SensorMetadata {
            sensor_id: id.to_string(),
            serial_number,
            locations: periods
                .iter()
                .map(|(from, to, lid)| SensorLocation {
                    from_datetime: datetime(from),
                    to_datetime: datetime(to),
                    location_id: lid.to_string(),
                })
                .collect(),
            utc_offsets: vec![],
            pressure_data_source: None,
        }
    }

    fn store() -> MetadataStore {
        MetadataStore::new(
            vec![location("l1", 48.1, 11.5), location("l2", 48.2, 11.6)],
            vec![sensor(
                "ma",
                61,
                &[
                    ("2022-01-01T00:00:00+00:00", "2022-06-02T11:59:59+00:00", "l1"),
                    ("2022-06-02T12:00:00+00:00", "2022-12-31T23:59:59+00:00", "l2"),
                ],
            )],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn single_context_per_day() {
        let store = store();
        let date = NaiveDate::from_ymd_opt(2022, 3, 1).unwrap();
        let ctx = store.get_single("ma", date).unwrap();

        assert_eq!(ctx.location.location_id, "l1");
        assert_eq!(ctx.date(), date);
        assert_eq!(ctx.from_datetime, datetime("2022-03-01T00:00:00+00:00"));
        assert_eq!(ctx.to_datetime, datetime("2022-03-01T23:59:59+00:00"));
        assert_eq!(ctx.pressure_data_source, "ma");
    }

    #[test]
    fn split_day_and_missing_day() {
        let store = store();

        let split = NaiveDate::from_ymd_opt(2022, 6, 2).unwrap();
        let contexts = store.get("ma", split).unwrap();
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts[1].location.location_id, "l2");
        assert!(matches!(
            store.get_single("ma", split),
            Err(MetadataError::MultipleLocations(..))
        ));

        let before = NaiveDate::from_ymd_opt(2021, 12, 31).unwrap();
        assert!(matches!(
            store.get_single("ma", before),
            Err(MetadataError::NoLocationData(..))
        ));
        assert!(matches!(
            store.get("xx", before),
            Err(MetadataError::UnknownSensor(_))
        ));
    }

    #[test]
    fn reject_inconsistent_metadata() {
        let overlapping = MetadataStore::new(
            vec![location("l1", 0.0, 0.0)],
            vec![sensor(
                "ma",
                61,
                &[
                    ("2022-01-01T00:00:00+00:00", "2022-02-01T00:00:00+00:00", "l1"),
                    ("2022-01-15T00:00:00+00:00", "2022-03-01T00:00:00+00:00", "l1"),
                ],
            )],
            vec![],
        );
        assert!(matches!(overlapping, Err(MetadataError::Inconsistent(_))));

        let unknown_location = MetadataStore::new(
            vec![location("l1", 0.0, 0.0)],
            vec![sensor(
                "ma",
                61,
                &[("2022-01-01T00:00:00+00:00", "2022-02-01T00:00:00+00:00", "l9")],
            )],
            vec![],
        );
        assert!(matches!(unknown_location, Err(MetadataError::Inconsistent(_))));
    }

    #[test]
    fn load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("locations.json"),
            r#"[{"location_id": "TUM_I", "details": "TUM Innenstadt", "lat": 48.151, "lon": 11.569, "alt": 539}]"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("sensors.json"),
            r#"[{"sensor_id": "ma", "serial_number": 61, "locations": [
                {"from_datetime": "2022-01-01T00:00:00+00:00",
                 "to_datetime": "2022-12-31T23:59:59+00:00",
                 "location_id": "TUM_I"}]}]"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("campaigns.json"),
            r#"[{"campaign_id": "muccnet", "from_datetime": "2022-01-01T00:00:00+00:00",
                 "to_datetime": "2022-12-31T23:59:59+00:00",
                 "sensor_ids": ["ma"], "location_ids": ["TUM_I"]}]"#,
        )
        .unwrap();

        let store = MetadataStore::load(dir.path()).unwrap();
        assert_eq!(store.campaign("muccnet").unwrap().sensor_ids, vec!["ma"]);
        assert!(store.campaign("unknown").is_err());
    }
}
