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

//! A retrieval session binds one sensor data context to one container
//! and prepares the container inputs.

use super::container::RetrievalContainer;
use crate::{
    configuration::{AtmosphericProfileModel, DataConfig, RetrievalConfig, RetrievalJobConfig},
    constants::{DATALOGGER_FULL_DAY_LINES, DATALOGGER_MIN_LINES, GGG2020_HOURS},
    errors::SessionError,
    metadata::SensorDataContext,
    utils,
};
use chrono::{NaiveDate, Utc};
use log::Level;
use std::{fs, os::unix::fs::symlink, path::PathBuf};

#[derive(Clone, PartialEq, Debug)]
pub struct RetrievalSession {
    pub context: SensorDataContext,
    pub container: RetrievalContainer,
    pub job: RetrievalJobConfig,
}

impl RetrievalSession {
    pub fn date(&self) -> NaiveDate {
        self.context.date()
    }

    pub fn label(&self) -> String {
        format!(
            "{}/{} {} [{}]",
            self.context.sensor_id,
            self.date(),
            self.job.label(),
            self.container.container_id
        )
    }
}

/// Log lines of one session. Every line is forwarded to the
/// global logger and kept so it can be archived with the outputs.
#[derive(Clone, Debug, Default)]
pub struct SessionLog {
    prefix: String,
    lines: Vec<String>,
}

impl SessionLog {
    pub fn new(session: &RetrievalSession) -> Self {
        SessionLog {
            prefix: session.label(),
            lines: vec![],
        }
    }

    pub fn log(&mut self, level: Level, message: &str) {
        log::log!(level, "{} - {}", self.prefix, message);
        self.lines.push(format!(
            "{} {:<5} {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            level,
            message
        ));
    }

    pub fn info(&mut self, message: &str) {
        self.log(Level::Info, message);
    }

    pub fn warn(&mut self, message: &str) {
        self.log(Level::Warn, message);
    }

    pub fn debug(&mut self, message: &str) {
        self.log(Level::Debug, message);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// Fills the container input directory with interferograms,
/// datalogger file and atmospheric profiles.
pub fn prepare_inputs(
    session: &RetrievalSession,
    config: &RetrievalConfig,
    data: &DataConfig,
    log: &mut SessionLog,
) -> Result<(), SessionError> {
    move_ifg_files(session, config, data, log)?;
    move_datalogger_files(session, data, log)?;
    move_profiles(session, session.job.atmospheric_profile_model, data, log)?;
    Ok(())
}

fn ifg_src_dir(session: &RetrievalSession, data: &DataConfig) -> PathBuf {
    data.interferograms
        .join(&session.context.sensor_id)
        .join(utils::date_string(session.date()))
}

fn list_ifg_files(
    session: &RetrievalSession,
    config: &RetrievalConfig,
    data: &DataConfig,
) -> Result<Vec<String>, SessionError> {
    let src_dir = ifg_src_dir(session, data);
    if !src_dir.is_dir() {
        return Err(SessionError::MissingInput(format!(
            "ifg directory {} does not exist",
            src_dir.display()
        )));
    }

    let pattern = config.ifg_regex(&session.context.sensor_id, session.date())?;

    let mut filenames = vec![];
    for entry in fs::read_dir(&src_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if pattern.is_match(&name) {
            filenames.push(name);
        }
    }
    filenames.sort();

    Ok(filenames)
}

/// Links all interferograms into the container, renamed to
/// `<YYMMDD>SN.<n>` as the retrieval expects them.
fn move_ifg_files(
    session: &RetrievalSession,
    config: &RetrievalConfig,
    data: &DataConfig,
    log: &mut SessionLog,
) -> Result<(), SessionError> {
    let src_dir = ifg_src_dir(session, data);
    let filenames = list_ifg_files(session, config, data)?;

    log.debug(&format!(
        "{} ifg files found in src directory ({})",
        filenames.len(),
        src_dir.display()
    ));
    if filenames.is_empty() {
        return Err(SessionError::MissingInput("no ifg input files".to_string()));
    }

    if let Some(mask) = &config.ifg_file_permissions.during_processing {
        change_ifg_permissions(session, config, data, mask, log)?;
    } else {
        log.debug("Skipping modification of ifg file permissions during processing");
    }

    let short_date = utils::short_date_string(session.date());
    let dst_dir = session.container.data_input_path.join("ifg").join(&short_date);
    fs::create_dir_all(&dst_dir)?;

    for (index, filename) in filenames.iter().enumerate() {
        symlink(
            src_dir.join(filename),
            dst_dir.join(format!("{}SN.{}", short_date, index + 1)),
        )?;
    }

    Ok(())
}

fn change_ifg_permissions(
    session: &RetrievalSession,
    config: &RetrievalConfig,
    data: &DataConfig,
    mask: &str,
    log: &mut SessionLog,
) -> Result<(), SessionError> {
    let mode = utils::parse_permission_mask(mask)
        .ok_or_else(|| SessionError::InvalidInput(format!("invalid permission mask {}", mask)))?;
    let src_dir = ifg_src_dir(session, data);

    for filename in list_ifg_files(session, config, data)? {
        if let Err(err) = utils::set_permissions(&src_dir.join(&filename), mode) {
            if config.ifg_file_permissions.fail_on_permission_error {
                return Err(err.into());
            }
            log.warn(&format!("Cannot change permissions of {}: {}", filename, err));
        }
    }

    Ok(())
}

/// Applies the `after_processing` permissions to the interferograms.
pub fn restore_ifg_permissions(
    session: &RetrievalSession,
    config: &RetrievalConfig,
    data: &DataConfig,
    log: &mut SessionLog,
) -> Result<(), SessionError> {
    match &config.ifg_file_permissions.after_processing {
        Some(mask) => change_ifg_permissions(session, config, data, mask, log),
        None => Ok(()),
    }
}

/// Copies the single datalogger file of the date into the container.
fn move_datalogger_files(
    session: &RetrievalSession,
    data: &DataConfig,
    log: &mut SessionLog,
) -> Result<(), SessionError> {
    let src_dir = data.datalogger.join(&session.context.pressure_data_source);
    if !src_dir.is_dir() {
        return Err(SessionError::MissingInput(format!(
            "datalogger directory {} does not exist",
            src_dir.display()
        )));
    }

    let prefix = format!("{}_", session.date().format("%Y-%m-%d"));
    let mut matching_files = vec![];
    for entry in fs::read_dir(&src_dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) && name.ends_with(".dat") {
            matching_files.push(name);
        }
    }

    let filename = match matching_files.as_slice() {
        [] => return Err(SessionError::MissingInput("no datalogger file found".to_string())),
        [single] => single,
        many => {
            return Err(SessionError::InvalidInput(format!(
                "multiple datalogger files found: {}",
                many.join(", ")
            )))
        }
    };

    let src_file = src_dir.join(filename);
    let line_count = utils::count_lines(&src_file)?;

    if line_count < DATALOGGER_FULL_DAY_LINES {
        log.warn(&format!(
            "Datalogger file only has {}/{} lines",
            line_count, DATALOGGER_FULL_DAY_LINES
        ));
    }
    if line_count < DATALOGGER_MIN_LINES {
        return Err(SessionError::InvalidInput(format!(
            "datalogger file has less than {} lines",
            DATALOGGER_MIN_LINES
        )));
    }

    let dst_file = session
        .container
        .data_input_path
        .join("log")
        .join(format!("{}.dat", &filename[..10]));
    fs::copy(src_file, dst_file)?;

    Ok(())
}

/// Copies the atmospheric profiles of the date and location
/// into the container.
fn move_profiles(
    session: &RetrievalSession,
    model: AtmosphericProfileModel,
    data: &DataConfig,
    log: &mut SessionLog,
) -> Result<(), SessionError> {
    let ctx = &session.context;
    let slug = utils::coordinates_slug(
        ctx.location.lat.round() as i32,
        ctx.location.lon.round() as i32,
    );
    let date_string = utils::date_string(session.date());
    let src_dir = data.atmospheric_profiles.join(model.as_str());
    let dst_dir = session.container.data_input_path.join("map");

    let files: Vec<(String, String)> = match model {
        AtmosphericProfileModel::GGG2014 => ["map", "mod"]
            .iter()
            .map(|ext| {
                (
                    format!("{}_{}.{}", date_string, slug, ext),
                    format!("{}{}.{}", ctx.sensor_id, date_string, ext),
                )
            })
            .collect(),
        AtmosphericProfileModel::GGG2020 => {
            let (date_string, slug) = (&date_string, &slug);
            GGG2020_HOURS
                .iter()
                .flat_map(|hour| {
                    ["map", "mod", "vmr"].iter().map(move |ext| {
                        let name = format!("{}{:02}_{}.{}", date_string, hour, slug, ext);
                        (name.clone(), name)
                    })
                })
                .collect()
        }
    };

    for (src_name, dst_name) in &files {
        let src_file = src_dir.join(src_name);
        if !src_file.is_file() {
            return Err(SessionError::MissingInput(format!(
                "{} profile file {} does not exist",
                model, src_name
            )));
        }
        fs::copy(&src_file, dst_dir.join(dst_name))?;
    }

    log.debug(&format!("Copied {} {} profile files", files.len(), model));
    Ok(())
}
