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

//! Evaluation and archiving of the retrieval outputs.

use super::session::{RetrievalSession, SessionLog};
use crate::{
    configuration::{AtmosphericProfileModel, DataConfig, RetrievalJobConfig},
    constants::KNOWN_RETRIEVAL_ERRORS,
    errors::SessionError,
    metadata::SensorDataContext,
    utils,
};
use chrono::{NaiveDate, Utc};
use serde_json::json;
use std::{
    fs,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum OutputState {
    Successful,
    Failed,
}

impl OutputState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputState::Successful => "successful",
            OutputState::Failed => "failed",
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RetrievalOutcome {
    Succeeded,
    Failed { reason: Option<String> },
}

impl RetrievalOutcome {
    pub fn state(&self) -> OutputState {
        match self {
            RetrievalOutcome::Succeeded => OutputState::Successful,
            RetrievalOutcome::Failed { .. } => OutputState::Failed,
        }
    }
}

/// `<results>/<algorithm>/<model>/<sensor>/<state>/<YYYYMMDD>`
pub fn results_dir(
    data: &DataConfig,
    algorithm: &str,
    model: AtmosphericProfileModel,
    sensor_id: &str,
    date: NaiveDate,
    state: OutputState,
) -> PathBuf {
    data.results
        .join(algorithm)
        .join(model.as_str())
        .join(sensor_id)
        .join(state.as_str())
        .join(utils::date_string(date))
}

pub fn output_dir(
    job: &RetrievalJobConfig,
    data: &DataConfig,
    sensor_id: &str,
    date: NaiveDate,
    state: OutputState,
) -> PathBuf {
    results_dir(
        data,
        &job.retrieval_algorithm,
        job.atmospheric_profile_model,
        sensor_id,
        date,
        state,
    )
}

/// State of the archived outputs of the job, if there are any.
pub fn output_state(job: &RetrievalJobConfig, data: &DataConfig, sensor_id: &str, date: NaiveDate) -> Option<OutputState> {
    [OutputState::Successful, OutputState::Failed]
        .into_iter()
        .find(|state| output_dir(job, data, sensor_id, date, *state).is_dir())
}

pub fn outputs_exist(job: &RetrievalJobConfig, data: &DataConfig, sensor_id: &str, date: NaiveDate) -> bool {
    output_state(job, data, sensor_id, date).is_some()
}

pub fn output_csv_name(ctx: &SensorDataContext) -> String {
    let date = utils::short_date_string(ctx.date());
    format!(
        "comb_invparms_{}_SN{:03}_{}-{}.csv",
        ctx.sensor_id, ctx.serial_number, date, date
    )
}

/// First file with the given name anywhere below `dir`.
pub fn find_file(dir: &Path, filename: &str) -> Result<Option<PathBuf>, walkdir::Error> {
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() && entry.file_name() == filename {
            return Ok(Some(entry.into_path()));
        }
    }
    Ok(None)
}

/// The retrieval succeeded when its output csv contains
/// at least one data line.
pub fn evaluate(session: &RetrievalSession) -> Result<RetrievalOutcome, SessionError> {
    let csv_name = output_csv_name(&session.context);
    if let Some(csv_path) = find_file(&session.container.data_output_path, &csv_name)? {
        if utils::count_lines(&csv_path)? > 1 {
            return Ok(RetrievalOutcome::Succeeded);
        }
    }

    Ok(RetrievalOutcome::Failed {
        reason: detect_error_type(&session.container.data_output_path)?,
    })
}

/// Looks for known error messages in the logfiles of the output.
pub fn detect_error_type(output_dir: &Path) -> Result<Option<String>, SessionError> {
    for (logfile, message) in KNOWN_RETRIEVAL_ERRORS {
        if let Some(path) = find_file(output_dir, logfile)? {
            if fs::read_to_string(path)?.contains(message) {
                return Ok(Some(message.to_string()));
            }
        }
    }
    Ok(None)
}

/// Moves the outputs of the session into the results directory. Older
/// outputs of the same sensor and date are replaced.
pub fn archive(
    session: &RetrievalSession,
    outcome: &RetrievalOutcome,
    data: &DataConfig,
    log: &mut SessionLog,
) -> Result<PathBuf, SessionError> {
    let ctx = &session.context;
    let job = &session.job;
    let date = session.date();

    for state in [OutputState::Successful, OutputState::Failed] {
        let dir = output_dir(job, data, &ctx.sensor_id, date, state);
        if dir.is_dir() {
            log.debug(&format!("Removing old outputs at {}", dir.display()));
            fs::remove_dir_all(&dir)?;
        }
    }

    let dst_dir = output_dir(job, data, &ctx.sensor_id, date, outcome.state());
    log.info(&format!("Moving outputs to {}", dst_dir.display()));
    utils::copy_dir_all(&session.container.data_output_path, &dst_dir)?;

    let now = Utc::now();
    let about = json!({
        "retrievalAlgorithm": job.retrieval_algorithm,
        "atmosphericProfileModel": job.atmospheric_profile_model.as_str(),
        "automationVersion": env!("CARGO_PKG_VERSION"),
        "automationCommitSha": utils::commit_sha(),
        "generationDate": now.format("%Y%m%d").to_string(),
        "generationTime": now.format("%T").to_string(),
        "containerId": session.container.container_id,
        "session": ctx,
        "outcome": match outcome {
            RetrievalOutcome::Succeeded => json!({ "state": "succeeded" }),
            RetrievalOutcome::Failed { reason } => json!({ "state": "failed", "reason": reason }),
        },
    });
    fs::write(dst_dir.join("about.json"), serde_json::to_string_pretty(&about)?)?;

    let logfiles_dir = dst_dir.join("logfiles");
    fs::create_dir_all(&logfiles_dir)?;
    fs::write(logfiles_dir.join("automation.log"), log.lines().join("\n") + "\n")?;

    Ok(dst_dir)
}
