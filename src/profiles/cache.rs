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

//! Cache of the submitted profile requests.

use super::queries::DownloadQuery;
use crate::{configuration::AtmosphericProfileModel, errors::ProfilesError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct CachedQuery {
    pub model: AtmosphericProfileModel,
    pub query: DownloadQuery,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct DownloadQueryCache {
    path: PathBuf,
    entries: Vec<CachedQuery>,
}

impl DownloadQueryCache {
    pub fn load(path: &Path) -> Result<Self, ProfilesError> {
        let entries = match fs::read(path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => vec![],
            Err(err) => return Err(err.into()),
        };

        Ok(DownloadQueryCache {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Requests of the model still waiting for an answer.
    pub fn get_active_queries(
        &self,
        model: AtmosphericProfileModel,
        timeout_hours: u32,
        now: DateTime<Utc>,
    ) -> Vec<DownloadQuery> {
        let oldest = now - Duration::hours(i64::from(timeout_hours));
        self.entries
            .iter()
            .filter(|e| e.model == model && e.requested_at > oldest)
            .map(|e| e.query.clone())
            .collect()
    }

    pub fn add(&mut self, model: AtmosphericProfileModel, query: DownloadQuery, now: DateTime<Utc>) {
        self.entries.push(CachedQuery {
            model,
            query,
            requested_at: now,
        });
    }

    /// Forgets expired requests and writes the cache file.
    pub fn dump(&mut self, timeout_hours: u32, now: DateTime<Utc>) -> Result<(), ProfilesError> {
        let oldest = now - Duration::hours(i64::from(timeout_hours));
        self.entries.retain(|e| e.requested_at > oldest);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.entries)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::tests::datetime;
    use chrono::NaiveDate;

    fn query(lat: i32) -> DownloadQuery {
        DownloadQuery {
            lat,
            lon: 11,
            from_date: NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
            to_date: NaiveDate::from_ymd_opt(2022, 1, 7).unwrap(),
        }
    }

    #[test]
    fn queries_expire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache/profiles.json");

        let mut cache = DownloadQueryCache::load(&path).unwrap();
        cache.add(AtmosphericProfileModel::GGG2014, query(48), datetime("2022-02-01T00:00:00+00:00"));
        cache.add(AtmosphericProfileModel::GGG2014, query(49), datetime("2022-02-01T20:00:00+00:00"));
        cache.add(AtmosphericProfileModel::GGG2020, query(50), datetime("2022-02-01T20:00:00+00:00"));

        let now = datetime("2022-02-02T12:00:00+00:00");
        assert_eq!(
            cache.get_active_queries(AtmosphericProfileModel::GGG2014, 24, now),
            vec![query(49)]
        );

        cache.dump(24, now).unwrap();
        let reloaded = DownloadQueryCache::load(&path).unwrap();
        assert_eq!(reloaded.get_active_queries(AtmosphericProfileModel::GGG2014, 24, now), vec![query(49)]);
        assert_eq!(reloaded.get_active_queries(AtmosphericProfileModel::GGG2020, 24, now), vec![query(50)]);
        assert_eq!(reloaded.entries.len(), 2);
    }
}
