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

//! Shared fixture for the retrieval tests: a temporary data tree,
//! metadata for the sensors `ma` and `mb` and a mock retrieval program.

use super::{container::ContainerFactory, session::RetrievalSession};
use crate::{
    configuration::{
        AtmosphericProfileModel, DataConfig, DataSources, RetrievalConfig, RetrievalJobConfig, StorageDataFilter,
    },
    metadata::{
        tests::{location, sensor},
        MetadataStore,
    },
};
use chrono::NaiveDate;
use std::{cell::RefCell, fs, path::Path, path::PathBuf};
use tempfile::TempDir;

/// Writes `comb_invparms_<sensor>_SN<serial>_<date>-<date>.csv` into the
/// output directory, fails when the sensor id is `fail`.
pub const MOCK_RETRIEVAL: &str = r#"#!/bin/sh
out="$1"
if [ "$2" = "fail" ]; then
    mkdir -p "$out/logfiles"
    echo "charfilter not found!" > "$out/logfiles/preprocess_output.log"
    exit 1
fi
name="comb_invparms_$2_SN$(printf '%03d' "$3")_$4-$4.csv"
mkdir -p "$out/results"
echo "HHMMSS_ID,UTCtimeh,XCO2" > "$out/results/$name"
echo "120000,12.0,410.5" >> "$out/results/$name"
echo "mock retrieval for $2 on $4 done"
"#;

pub fn date(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2022, m, d).unwrap()
}

pub fn data_config(root: &Path) -> DataConfig {
    DataConfig {
        datalogger: root.join("log"),
        atmospheric_profiles: root.join("map"),
        interferograms: root.join("ifg"),
        results: root.join("results"),
    }
}

pub fn job(root: &Path, retrieval_algorithm: &str) -> RetrievalJobConfig {
    RetrievalJobConfig {
        retrieval_algorithm: retrieval_algorithm.to_string(),
        atmospheric_profile_model: AtmosphericProfileModel::GGG2014,
        code_dir: root.join("code"),
        command: ["/bin/sh", "run.sh", "%OUTPUT_DIR%", "%SENSOR_ID%", "%SERIAL_NUMBER%", "%DATE_SHORT%"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        storage_data_filter: StorageDataFilter {
            sensor_ids_to_consider: vec!["ma".to_string(), "mb".to_string()],
            from_date: date(6, 1),
            to_date: date(6, 30),
            min_days_delay: 5,
        },
    }
}

pub fn retrieval_config(root: &Path) -> RetrievalConfig {
    RetrievalConfig {
        max_process_count: 2,
        timeout_seconds: 60,
        poll_interval_ms: 10,
        containers_dir: root.join("containers"),
        ifg_file_regex: r"^$(SENSOR_ID)$(DATE).*\.\d+$".to_string(),
        manual_queue_file: root.join("manual-queue.json"),
        status_file: root.join("status.json"),
        data_sources: DataSources::default(),
        ifg_file_permissions: Default::default(),
        jobs: vec![job(root, "proffast-2.3")],
    }
}

pub fn metadata() -> MetadataStore {
    MetadataStore::new(
        vec![location("l1", 48.1, 11.5)],
        vec![
            sensor("ma", 61, &[("2022-01-01T00:00:00+00:00", "2022-12-31T23:59:59+00:00", "l1")]),
            sensor("mb", 86, &[("2022-06-03T00:00:00+00:00", "2022-12-31T23:59:59+00:00", "l1")]),
            sensor("fail", 1, &[("2022-01-01T00:00:00+00:00", "2022-12-31T23:59:59+00:00", "l1")]),
        ],
        vec![],
    )
    .unwrap()
}

pub fn write_code(root: &Path) {
    fs::create_dir_all(root.join("code/main")).unwrap();
    fs::write(root.join("code/main/run.sh"), MOCK_RETRIEVAL).unwrap();
}

pub struct Fixture {
    _dir: TempDir,
    pub root: PathBuf,
    pub config: RetrievalConfig,
    pub data: DataConfig,
    pub metadata: MetadataStore,
    factory: RefCell<Option<ContainerFactory>>,
}

impl Fixture {
    /// The first configured job.
    pub fn job(&self) -> &RetrievalJobConfig {
        &self.config.jobs[0]
    }

    /// A session of the first job with a freshly created container.
    pub fn session(&self, sensor_id: &str, date: NaiveDate) -> RetrievalSession {
        let mut factory = self.factory.borrow_mut();
        let factory = factory.get_or_insert_with(|| ContainerFactory::new(&self.config).unwrap());
        RetrievalSession {
            context: self.metadata.get_single(sensor_id, date).unwrap(),
            container: factory.create_container(self.job()).unwrap(),
            job: self.job().clone(),
        }
    }
}

pub fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    write_code(&root);

    Fixture {
        config: retrieval_config(&root),
        data: data_config(&root),
        metadata: metadata(),
        factory: RefCell::new(None),
        root,
        _dir: dir,
    }
}
