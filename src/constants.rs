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

//! Module containing constants used by the pipeline.

/// Length of randomly generated container identifiers.
pub const CONTAINER_ID_LENGTH: usize = 10;

/// Prefix of every container directory inside the containers directory.
pub const CONTAINER_PREFIX: &str = "retrieval-container";

/// A complete datalogger file has one line per minute plus a header.
pub const DATALOGGER_FULL_DAY_LINES: usize = 1441;

/// Datalogger files shorter than this are not usable at all.
pub const DATALOGGER_MIN_LINES: usize = 30;

/// Hours of the 3-hourly GGG2020 profiles.
pub const GGG2020_HOURS: [u32; 8] = [0, 3, 6, 9, 12, 15, 18, 21];

/// Known error messages of the retrieval program, paired with the
/// logfile they appear in.
pub const KNOWN_RETRIEVAL_ERRORS: [(&str, &str); 4] = [
    ("preprocess_output.log", "charfilter not found!"),
    ("preprocess_output.log", "Zero IFG block size!"),
    ("inv_output.log", "CO channel: no natural grid!"),
    ("inv_output.log", "Cannot access tabellated x-sections!"),
];

/// Name of the file signalling whether an interferogram upload has finished.
pub const UPLOAD_META_FILE: &str = "upload-meta.json";

/// Requested profiles are never closer to now than this.
pub const PROFILES_REQUEST_DELAY_HOURS: i64 = 12;

/// Repository of the pipeline, written into every generated file.
pub const PIPELINE_REPOSITORY: &str = "https://github.com/tum-esm/em27-retrieval-pipeline";

/// How long `retrieval stop` waits for the scheduler to exit.
pub const STOP_TIMEOUT_SECONDS: u64 = 120;
