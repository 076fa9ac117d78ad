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

//! Module requesting and collecting the atmospheric profiles
//! needed by the retrievals.

pub mod cache;
pub mod queries;
pub mod server;

use crate::{
    configuration::{AtmosphericProfileModel, Config, DataConfig, ProfilesConfig},
    errors::{PipelineError, ProfilesError},
    metadata::MetadataStore,
};
use cache::DownloadQueryCache;
use chrono::{DateTime, Utc};
use log::{info, warn};
use server::{DirectoryServer, ProfilesServer};

/// What one run did for one model.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ModelSummary {
    pub model: AtmosphericProfileModel,
    pub collected_files: usize,
    pub pending_queries: usize,
    pub submitted_queries: usize,
}

pub fn main(config: &Config) -> Result<(), PipelineError> {
    let profiles = config.profiles()?;
    let metadata = MetadataStore::load(&config.general.metadata_dir)?;
    let server = DirectoryServer::new(&profiles.server.email, &profiles.server.exchange_dir);

    run(profiles, &config.general.data, &metadata, &server, Utc::now())?;
    Ok(())
}

pub fn request_status(config: &Config) -> Result<(), PipelineError> {
    let profiles = config.profiles()?;
    DirectoryServer::new(&profiles.server.email, &profiles.server.exchange_dir).request_status()?;
    info!("Requested profile service status for {}", profiles.server.email);
    Ok(())
}

/// Collects finished downloads, then submits the missing requests of
/// every configured model. At most `max_requests_per_run` requests are
/// submitted in total.
pub fn run<S: ProfilesServer>(
    config: &ProfilesConfig,
    data: &DataConfig,
    metadata: &MetadataStore,
    server: &S,
    now: DateTime<Utc>,
) -> Result<Vec<ModelSummary>, ProfilesError> {
    let timeout_hours = config.server.request_timeout_hours;
    let mut cache = DownloadQueryCache::load(&config.cache_file)?;
    let mut remaining_requests = config.server.max_requests_per_run;
    let mut summaries = vec![];

    for model in &config.scope.models {
        let model = *model;
        let profiles_dir = data.atmospheric_profiles.join(model.as_str());

        let collected_files = server.collect(model, &profiles_dir)?;
        info!("{} - collected {} new profile files", model, collected_files);

        let active_queries = cache.get_active_queries(model, timeout_hours, now);
        let queries = queries::generate_download_queries(
            &profiles_dir,
            model,
            &config.scope,
            &config.ggg2020_standard_sites,
            metadata,
            &active_queries,
            now,
        )?;
        info!(
            "{} - {} queries are pending, {} new queries needed",
            model,
            active_queries.len(),
            queries.len()
        );

        let mut submitted_queries = 0;
        for query in queries.into_iter().take(remaining_requests) {
            match server.request(model, &query) {
                Ok(()) => {
                    info!(
                        "{} - requested {}..{} at ({}, {})",
                        model, query.from_date, query.to_date, query.lat, query.lon
                    );
                    cache.add(model, query, now);
                    submitted_queries += 1;
                }
                Err(err) => warn!("{} - request failed: {}", model, err),
            }
        }
        remaining_requests -= submitted_queries;

        summaries.push(ModelSummary {
            model,
            collected_files,
            pending_queries: active_queries.len(),
            submitted_queries,
        });
    }

    cache.dump(timeout_hours, now)?;
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::ProfilesServerConfig;
    use crate::metadata::tests::datetime;
    use std::fs;

    #[test]
    fn requests_are_limited_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut scope = queries::tests::scope();
        scope.models = vec![AtmosphericProfileModel::GGG2014];

        let config = ProfilesConfig {
            server: ProfilesServerConfig {
                email: "someone@example.com".to_string(),
                exchange_dir: dir.path().join("exchange"),
                max_requests_per_run: 5,
                request_timeout_hours: 24,
            },
            scope,
            cache_file: dir.path().join("profiles-cache.json"),
            ggg2020_standard_sites: vec![],
        };
        let data = crate::retrieval::test_support::data_config(dir.path());
        let metadata = queries::tests::metadata();
        let server = DirectoryServer::new(&config.server.email, &config.server.exchange_dir);
        let now = datetime("2000-07-01T00:00:00+00:00");

        let first = run(&config, &data, &metadata, &server, now).unwrap();
        assert_eq!(first[0].submitted_queries, 5);
        assert_eq!(fs::read_dir(dir.path().join("exchange/upload")).unwrap().count(), 5);

        // the 5 submitted queries are pending, the other 2 are sent now
        let second = run(&config, &data, &metadata, &server, now).unwrap();
        assert_eq!(second[0].pending_queries, 5);
        assert_eq!(second[0].submitted_queries, 2);

        // service answered the first query
        let download = dir.path().join("exchange/download/GGG2014");
        fs::create_dir_all(&download).unwrap();
        fs::write(download.join("20000101_01N002E.map"), "").unwrap();
        fs::write(download.join("20000101_01N002E.mod"), "").unwrap();

        let third = run(&config, &data, &metadata, &server, now).unwrap();
        assert_eq!(third[0].collected_files, 2);
        assert_eq!(third[0].submitted_queries, 0);
        assert!(data.atmospheric_profiles.join("GGG2014/20000101_01N002E.map").is_file());
    }
}
