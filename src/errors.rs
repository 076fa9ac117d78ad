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

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Error while reading config.yaml: {0}")]
    Config(#[from] ConfigError),

    #[error("Error while reading metadata: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Error in retrieval queue: {0}")]
    Queue(#[from] QueueError),

    #[error("Error in container lifecycle: {0}")]
    Container(#[from] ContainerError),

    #[error("Error while processing retrieval session: {0}")]
    Session(#[from] SessionError),

    #[error("Error while handling atmospheric profiles: {0}")]
    Profiles(#[from] ProfilesError),

    #[error("Error while exporting merged outputs: {0}")]
    Export(#[from] ExportError),

    #[error("Error while creating ThreadPool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Another retrieval process (pid {1}) holds the lock file {0}")]
    AlreadyRunning(PathBuf, i32),

    #[error("Retrieval process {0} did not stop within {1} seconds")]
    StopTimeout(i32, u64),

    #[error("Error while writing report: {0}")]
    Report(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot open config.yaml: {0}")]
    CantOpenFile(#[from] std::io::Error),

    #[error("Cannot deserialize config.yaml: {0}")]
    CantDeserialize(#[from] serde_yaml::Error),

    #[error("Configuration component is out of bounds {0}")]
    OutOfBounds(&'static str),

    #[error("Interferogram file regex is invalid: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("Configuration section {0} is required for this command")]
    MissingSection(&'static str),
}

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Cannot open metadata file {0}: {1}")]
    CantOpenFile(PathBuf, std::io::Error),

    #[error("Cannot deserialize metadata file {0}: {1}")]
    CantDeserialize(PathBuf, serde_json::Error),

    #[error("Metadata is inconsistent: {0}")]
    Inconsistent(String),

    #[error("Unknown sensor {0}")]
    UnknownSensor(String),

    #[error("Unknown campaign {0}")]
    UnknownCampaign(String),

    #[error("No location data for sensor {0} on {1}")]
    NoLocationData(String, chrono::NaiveDate),

    #[error("Sensor {0} has multiple locations on {1}")]
    MultipleLocations(String, chrono::NaiveDate),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Cannot access manual queue file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot (de)serialize manual queue file: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Cannot (de)serialize retrieval status file: {0}")]
    Status(serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Retrieval code directory does not exist: {0}")]
    MissingCode(PathBuf),

    #[error("No container with id \"{0}\"")]
    UnknownContainer(String),

    #[error("Installer script failed with exit code {0:?}: {1}")]
    InstallFailed(Option<i32>, String),

    #[error("Container I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Retrieval process timed out after {0} seconds")]
    Timeout(u64),

    #[error("Retrieval was cancelled by a stop request")]
    Cancelled,

    #[error("Invalid interferogram regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("Cannot walk output directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Cannot serialize about.json: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Session I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ProfilesError {
    #[error("Cannot access profiles data: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot (de)serialize download query cache: {0}")]
    Cache(#[from] serde_json::Error),

    #[error("Profile server rejected the request: {0}")]
    Server(String),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Cannot read or write csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("Column {0} is missing in {1}")]
    MissingColumn(String, PathBuf),

    #[error("Cannot parse value {0:?} in {1}")]
    InvalidValue(String, PathBuf),

    #[error("Cannot search results directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Export I/O error: {0}")]
    Io(#[from] std::io::Error),
}
