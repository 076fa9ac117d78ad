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

//! Module responsible for parsing and checking the configuration file.
//!
//! The configuration file uses [YAML](https://en.wikipedia.org/wiki/YAML)
//! and `serde` to enforce strong typing and automatic type checking.
//!
//! The structures and their fields in this module directly correspond to
//! the fields inside `config.yaml` so you can check this documentation
//! for more details how to set the config file.

use crate::errors::ConfigError;
use crate::utils;
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

/// Meteorological model providing the atmospheric profiles
/// (pressure, temperature and trace gas priors) to the retrieval.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub enum AtmosphericProfileModel {
    GGG2014,
    GGG2020,
}

impl AtmosphericProfileModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AtmosphericProfileModel::GGG2014 => "GGG2014",
            AtmosphericProfileModel::GGG2020 => "GGG2020",
        }
    }
}

impl fmt::Display for AtmosphericProfileModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quantities that can be exported from the retrieval outputs.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    GndP,
    GndT,
    AppSza,
    Azimuth,
    Xh2o,
    Xair,
    Xco2,
    Xch4,
    Xco,
    Xch4S5p,
}

impl DataType {
    /// Name used in the export files.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::GndP => "gnd_p",
            DataType::GndT => "gnd_t",
            DataType::AppSza => "app_sza",
            DataType::Azimuth => "azimuth",
            DataType::Xh2o => "xh2o",
            DataType::Xair => "xair",
            DataType::Xco2 => "xco2",
            DataType::Xch4 => "xch4",
            DataType::Xco => "xco",
            DataType::Xch4S5p => "xch4_s5p",
        }
    }

    /// Name of the column in the retrieval output csv.
    pub fn column_name(&self) -> &'static str {
        match self {
            DataType::GndP => "gndP",
            DataType::GndT => "gndT",
            DataType::AppSza => "appSZA",
            DataType::Azimuth => "azimuth",
            DataType::Xh2o => "XH2O",
            DataType::Xair => "XAIR",
            DataType::Xco2 => "XCO2",
            DataType::Xch4 => "XCH4",
            DataType::Xco => "XCO",
            DataType::Xch4S5p => "XCH4_S5P",
        }
    }
}

/// Time resolution of exported data.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub enum SamplingRate {
    #[serde(rename = "10m")]
    TenMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "2m")]
    TwoMinutes,
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "30s")]
    ThirtySeconds,
    #[serde(rename = "15s")]
    FifteenSeconds,
    #[serde(rename = "10s")]
    TenSeconds,
    #[serde(rename = "5s")]
    FiveSeconds,
    #[serde(rename = "2s")]
    TwoSeconds,
    #[serde(rename = "1s")]
    OneSecond,
}

impl SamplingRate {
    pub fn seconds(&self) -> i64 {
        match self {
            SamplingRate::TenMinutes => 600,
            SamplingRate::FiveMinutes => 300,
            SamplingRate::TwoMinutes => 120,
            SamplingRate::OneMinute => 60,
            SamplingRate::ThirtySeconds => 30,
            SamplingRate::FifteenSeconds => 15,
            SamplingRate::TenSeconds => 10,
            SamplingRate::FiveSeconds => 5,
            SamplingRate::TwoSeconds => 2,
            SamplingRate::OneSecond => 1,
        }
    }
}

impl fmt::Display for SamplingRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.seconds();
        if secs >= 60 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{}s", secs)
        }
    }
}

/// Directories with the raw and processed data.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct DataConfig {
    /// Root of the datalogger files, one subdirectory per sensor
    /// (or pressure data source).
    pub datalogger: PathBuf,

    /// Root of the atmospheric profiles, one subdirectory per model.
    pub atmospheric_profiles: PathBuf,

    /// Root of the interferograms, laid out as `<sensor>/<YYYYMMDD>/`.
    pub interferograms: PathBuf,

    /// Root of the archived retrieval outputs.
    pub results: PathBuf,
}

#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct GeneralConfig {
    /// Directory containing `locations.json`, `sensors.json`
    /// and `campaigns.json`.
    pub metadata_dir: PathBuf,

    pub data: DataConfig,
}

/// Sources the retrieval queue takes its items from.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize)]
pub struct DataSources {
    #[serde(default = "default_true")]
    pub storage: bool,

    #[serde(default = "default_true")]
    pub manual_queue: bool,
}

impl Default for DataSources {
    fn default() -> Self {
        DataSources {
            storage: true,
            manual_queue: true,
        }
    }
}

/// Which (sensor, date) pairs from the interferogram storage
/// are considered by the retrieval queue.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct StorageDataFilter {
    pub sensor_ids_to_consider: Vec<String>,

    pub from_date: NaiveDate,

    pub to_date: NaiveDate,

    /// _(Optional)_ Days that have to pass before a date is processed,
    /// so that all of its data had the chance to arrive.
    ///
    /// Must be between `0` and `60`. Defaults to `5`.
    #[serde(default = "StorageDataFilter::default_min_days_delay")]
    pub min_days_delay: u16,
}

impl StorageDataFilter {
    fn default_min_days_delay() -> u16 {
        5
    }
}

/// Permissions applied to interferogram files while they are
/// used by a container and after it has finished.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct IfgFilePermissions {
    #[serde(default = "default_true")]
    pub fail_on_permission_error: bool,

    /// Permission mask like `r--r--r--`.
    #[serde(default)]
    pub during_processing: Option<String>,

    #[serde(default)]
    pub after_processing: Option<String>,
}

impl Default for IfgFilePermissions {
    fn default() -> Self {
        IfgFilePermissions {
            fail_on_permission_error: true,
            during_processing: None,
            after_processing: None,
        }
    }
}

/// One retrieval setup. Every job has its own queue and its own
/// results tree `<algorithm>/<model>/`.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct RetrievalJobConfig {
    /// Name of the retrieval algorithm, e.g. `proffast-2.3`.
    /// Used in the results directory layout.
    pub retrieval_algorithm: String,

    pub atmospheric_profile_model: AtmosphericProfileModel,

    /// Directory with the retrieval code. Its `main` subdirectory is
    /// copied into every container; an optional `install.sh` is run
    /// inside each new container.
    pub code_dir: PathBuf,

    /// Command running the retrieval inside a container. Every
    /// argument may contain `%KEY%` placeholders.
    pub command: Vec<String>,

    pub storage_data_filter: StorageDataFilter,
}

impl RetrievalJobConfig {
    pub fn label(&self) -> String {
        format!("{}/{}", self.retrieval_algorithm, self.atmospheric_profile_model)
    }

    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(ConfigError::OutOfBounds("Retrieval command cannot be empty"));
        }

        if self.retrieval_algorithm.is_empty()
            || !self
                .retrieval_algorithm
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
        {
            return Err(ConfigError::OutOfBounds(
                "Algorithm name may only contain letters, digits, '-', '.' and '_'",
            ));
        }

        let filter = &self.storage_data_filter;

        if filter.from_date > filter.to_date {
            return Err(ConfigError::OutOfBounds(
                "Storage filter from_date is after to_date",
            ));
        }

        if filter.min_days_delay > 60 {
            return Err(ConfigError::OutOfBounds(
                "Minimal days delay cannot be larger than 60",
            ));
        }

        Ok(())
    }
}

/// Fields controlling the automated retrieval.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct RetrievalConfig {
    /// _(Optional)_ Number of retrievals running in parallel.
    ///
    /// Must be between `1` and `64`. Defaults to `1`.
    #[serde(default = "RetrievalConfig::default_max_process_count")]
    pub max_process_count: usize,

    /// _(Optional)_ Time after which a retrieval process is killed.
    ///
    /// Defaults to 6 hours.
    #[serde(default = "RetrievalConfig::default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// _(Optional)_ How often running processes and the manual queue
    /// are polled, in milliseconds. Defaults to `1000`.
    #[serde(default = "RetrievalConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Directory holding the containers while they exist, the lock
    /// file and the log of background runs.
    pub containers_dir: PathBuf,

    /// _(Optional)_ Regex matching the interferogram file names.
    /// `$(SENSOR_ID)` and `$(DATE)` are replaced before compiling.
    #[serde(default = "RetrievalConfig::default_ifg_file_regex")]
    pub ifg_file_regex: String,

    pub manual_queue_file: PathBuf,

    pub status_file: PathBuf,

    #[serde(default)]
    pub data_sources: DataSources,

    #[serde(default)]
    pub ifg_file_permissions: IfgFilePermissions,

    /// Retrieval jobs, processed one after another in every run.
    pub jobs: Vec<RetrievalJobConfig>,
}

impl RetrievalConfig {
    fn default_max_process_count() -> usize {
        1
    }

    fn default_timeout_seconds() -> u64 {
        6 * 3600
    }

    fn default_poll_interval_ms() -> u64 {
        1000
    }

    fn default_ifg_file_regex() -> String {
        String::from(r"^$(SENSOR_ID)$(DATE).*\.\d+$")
    }

    /// Compiles the interferogram regex for given sensor and date.
    pub fn ifg_regex(&self, sensor_id: &str, date: NaiveDate) -> Result<Regex, regex::Error> {
        let expanded = self
            .ifg_file_regex
            .replace("$(SENSOR_ID)", sensor_id)
            .replace("$(DATE)", &date.format("%Y%m%d").to_string());
        Regex::new(&expanded)
    }

    /// Checks if retrieval settings follow conventions and limits.
    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if !(1..=64).contains(&self.max_process_count) {
            return Err(ConfigError::OutOfBounds(
                "Process count must be between 1 and 64",
            ));
        }

        if self.timeout_seconds < 1 {
            return Err(ConfigError::OutOfBounds(
                "Retrieval timeout cannot be less than 1 s",
            ));
        }

        if self.poll_interval_ms < 1 {
            return Err(ConfigError::OutOfBounds(
                "Poll interval cannot be less than 1 ms",
            ));
        }

        if self.jobs.is_empty() {
            return Err(ConfigError::OutOfBounds(
                "At least one retrieval job has to be configured",
            ));
        }

        let mut job_labels = vec![];
        for job in &self.jobs {
            job.check_bounds()?;

            if self.data_sources.storage && job.storage_data_filter.sensor_ids_to_consider.is_empty() {
                return Err(ConfigError::OutOfBounds(
                    "At least one sensor has to be considered when storage is a data source",
                ));
            }

            // two jobs with the same label would share one results tree
            let label = job.label();
            if job_labels.contains(&label) {
                return Err(ConfigError::OutOfBounds(
                    "Retrieval jobs must differ in algorithm or atmospheric profile model",
                ));
            }
            job_labels.push(label);
        }

        for mask in [
            &self.ifg_file_permissions.during_processing,
            &self.ifg_file_permissions.after_processing,
        ]
        .into_iter()
        .flatten()
        {
            if utils::parse_permission_mask(mask).is_none() {
                return Err(ConfigError::OutOfBounds(
                    "Permission masks must look like rwxr-xr-x",
                ));
            }
        }

        // placeholders are replaced by realistic values so that
        // the regex is checked the way it will be used
        self.ifg_regex("ma", NaiveDate::from_ymd_opt(2022, 1, 1).unwrap_or(NaiveDate::MIN))?;

        Ok(())
    }
}

/// Connection to the atmospheric profiles exchange.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct ProfilesServerConfig {
    /// Address the profile service answers to. Written into every request.
    pub email: String,

    /// Directory shared with the profile service, containing `upload/`
    /// and `download/<model>/`.
    pub exchange_dir: PathBuf,

    /// _(Optional)_ Requests submitted in one run. Defaults to `25`.
    #[serde(default = "ProfilesServerConfig::default_max_requests_per_run")]
    pub max_requests_per_run: usize,

    /// _(Optional)_ Hours after which an unanswered request is sent again.
    /// Defaults to `24`.
    #[serde(default = "ProfilesServerConfig::default_request_timeout_hours")]
    pub request_timeout_hours: u32,
}

impl ProfilesServerConfig {
    fn default_max_requests_per_run() -> usize {
        25
    }

    fn default_request_timeout_hours() -> u32 {
        24
    }
}

#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct ProfilesScopeConfig {
    pub from_date: NaiveDate,

    pub to_date: NaiveDate,

    pub models: Vec<AtmosphericProfileModel>,

    /// _(Optional)_ Longest date range of a single request.
    ///
    /// Must be between `1` and `56`. Defaults to `28`.
    #[serde(default = "ProfilesScopeConfig::default_max_days_per_query")]
    pub max_days_per_query: u16,
}

impl ProfilesScopeConfig {
    fn default_max_days_per_query() -> u16 {
        28
    }
}

/// Location for which GGG2020 profiles are produced
/// routinely and must not be requested.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct StandardSiteConfig {
    pub identifier: String,
    pub lat: f64,
    pub lon: f64,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
}

#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct ProfilesConfig {
    pub server: ProfilesServerConfig,

    pub scope: ProfilesScopeConfig,

    /// File remembering the requests that were already submitted.
    pub cache_file: PathBuf,

    #[serde(default, rename = "GGG2020_standard_sites")]
    pub ggg2020_standard_sites: Vec<StandardSiteConfig>,
}

impl ProfilesConfig {
    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.server.email.len() < 3 {
            return Err(ConfigError::OutOfBounds("Profiles email is too short"));
        }

        if self.server.max_requests_per_run < 1 {
            return Err(ConfigError::OutOfBounds(
                "At least one profiles request per run must be allowed",
            ));
        }

        if self.server.request_timeout_hours < 1 {
            return Err(ConfigError::OutOfBounds(
                "Request timeout cannot be less than 1 hour",
            ));
        }

        if self.scope.from_date > self.scope.to_date {
            return Err(ConfigError::OutOfBounds(
                "Profiles scope from_date is after to_date",
            ));
        }

        if !(1..=56).contains(&self.scope.max_days_per_query) {
            return Err(ConfigError::OutOfBounds(
                "Days per profiles query must be between 1 and 56",
            ));
        }

        if self
            .ggg2020_standard_sites
            .iter()
            .any(|site| site.from_date > site.to_date)
        {
            return Err(ConfigError::OutOfBounds(
                "Standard site from_date is after to_date",
            ));
        }

        Ok(())
    }
}

/// A campaign export written by `export run`.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct ExportTargetConfig {
    pub campaign_id: String,

    pub retrieval_algorithm: String,

    pub atmospheric_profile_model: AtmosphericProfileModel,

    pub data_types: Vec<DataType>,

    pub sampling_rate: SamplingRate,

    /// _(Optional)_ Longest gap (in seconds) that is filled by linear
    /// interpolation after resampling. Defaults to `180`.
    #[serde(default = "ExportTargetConfig::default_max_interpolation_gap_seconds")]
    pub max_interpolation_gap_seconds: u32,

    pub dst_dir: PathBuf,
}

impl ExportTargetConfig {
    fn default_max_interpolation_gap_seconds() -> u32 {
        180
    }

    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.data_types.is_empty() {
            return Err(ConfigError::OutOfBounds(
                "Export target needs at least one data type",
            ));
        }

        if self.campaign_id.is_empty() {
            return Err(ConfigError::OutOfBounds("Campaign id cannot be empty"));
        }

        Ok(())
    }
}

/// Main config structure representing the fields in
/// configuration file.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,

    #[serde(default)]
    pub retrieval: Option<RetrievalConfig>,

    #[serde(default)]
    pub profiles: Option<ProfilesConfig>,

    #[serde(default)]
    pub export_targets: Vec<ExportTargetConfig>,
}

impl Config {
    /// Config structure constructor, responsible for
    /// deserializing configuration and checking it.
    pub fn new_from_file(file_path: &Path) -> Result<Config, ConfigError> {
        let data = fs::read(file_path)?;
        Config::new_from_slice(data.as_slice())
    }

    pub fn new_from_slice(data: &[u8]) -> Result<Config, ConfigError> {
        let config: Config = serde_yaml::from_slice(data)?;

        if let Some(retrieval) = &config.retrieval {
            retrieval.check_bounds()?;
        }
        if let Some(profiles) = &config.profiles {
            profiles.check_bounds()?;
        }
        for target in &config.export_targets {
            target.check_bounds()?;
        }

        Ok(config)
    }

    pub fn retrieval(&self) -> Result<&RetrievalConfig, ConfigError> {
        self.retrieval
            .as_ref()
            .ok_or(ConfigError::MissingSection("retrieval"))
    }

    pub fn profiles(&self) -> Result<&ProfilesConfig, ConfigError> {
        self.profiles
            .as_ref()
            .ok_or(ConfigError::MissingSection("profiles"))
    }
}

fn default_true() -> bool {
    true
}
