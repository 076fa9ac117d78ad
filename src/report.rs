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

//! Report of the data present on disk, per sensor and day.

use crate::{
    configuration::{AtmosphericProfileModel, Config, DataConfig, RetrievalConfig},
    errors::{ConfigError, PipelineError},
    metadata::{MetadataStore, SensorDataContext},
    profiles::queries::{expected_filenames, ProfilesLocation},
    retrieval::outputs::{self, OutputState},
    utils,
};
use chrono::{NaiveDate, Utc};
use log::info;
use serde::Serialize;
use std::{fs, io, path::Path};

#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct ReportRow {
    pub sensor_id: String,
    pub date: NaiveDate,
    pub location_id: String,
    pub interferograms: usize,
    pub datalogger_lines: usize,
    pub ggg2014_profiles: bool,
    pub ggg2020_profiles: bool,
    pub retrieval_output: String,
}

pub fn main(config: &Config, output: &Path) -> Result<(), PipelineError> {
    let metadata = MetadataStore::load(&config.general.metadata_dir)?;
    let rows = build_report(
        config.retrieval.as_ref(),
        &config.general.data,
        &metadata,
        Utc::now().date_naive(),
    )?;

    for sensor in &metadata.sensors {
        let sensor_rows: Vec<&ReportRow> = rows.iter().filter(|r| r.sensor_id == sensor.sensor_id).collect();
        info!(
            "{}: {} days, {} with interferograms, {} with datalogger data, {} successful retrievals",
            sensor.sensor_id,
            sensor_rows.len(),
            sensor_rows.iter().filter(|r| r.interferograms > 0).count(),
            sensor_rows.iter().filter(|r| r.datalogger_lines > 0).count(),
            sensor_rows
                .iter()
                .filter(|r| r.retrieval_output.contains(OutputState::Successful.as_str()))
                .count()
        );
    }

    write_report(output, &rows)?;
    info!("Report written to {}", output.display());
    Ok(())
}

/// One row for every day on which a sensor has a location,
/// up to `today`.
pub fn build_report(
    retrieval: Option<&RetrievalConfig>,
    data: &DataConfig,
    metadata: &MetadataStore,
    today: NaiveDate,
) -> Result<Vec<ReportRow>, PipelineError> {
    let mut rows = vec![];

    for sensor in &metadata.sensors {
        let mut dates: Vec<NaiveDate> = sensor
            .locations
            .iter()
            .flat_map(|l| utils::date_range(l.from_datetime.date_naive(), l.to_datetime.date_naive().min(today)))
            .collect();
        dates.sort();
        dates.dedup();

        for date in dates {
            for ctx in metadata.get(&sensor.sensor_id, date)? {
                rows.push(ReportRow {
                    sensor_id: ctx.sensor_id.clone(),
                    date,
                    location_id: ctx.location.location_id.clone(),
                    interferograms: count_interferograms(retrieval, data, &ctx)?,
                    datalogger_lines: count_datalogger_lines(data, &ctx)?,
                    ggg2014_profiles: profiles_exist(data, AtmosphericProfileModel::GGG2014, &ctx),
                    ggg2020_profiles: profiles_exist(data, AtmosphericProfileModel::GGG2020, &ctx),
                    retrieval_output: output_states(retrieval, data, &ctx),
                });
            }
        }
    }

    Ok(rows)
}

pub fn write_report(path: &Path, rows: &[ReportRow]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn count_interferograms(
    retrieval: Option<&RetrievalConfig>,
    data: &DataConfig,
    ctx: &SensorDataContext,
) -> Result<usize, PipelineError> {
    let dir = data
        .interferograms
        .join(&ctx.sensor_id)
        .join(utils::date_string(ctx.date()));
    if !dir.is_dir() {
        return Ok(0);
    }

    let pattern = match retrieval {
        Some(retrieval) => Some(
            retrieval
                .ifg_regex(&ctx.sensor_id, ctx.date())
                .map_err(ConfigError::from)?,
        ),
        None => None,
    };

    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if pattern.as_ref().map_or(true, |p| p.is_match(&name)) {
            count += 1;
        }
    }
    Ok(count)
}

fn count_datalogger_lines(data: &DataConfig, ctx: &SensorDataContext) -> io::Result<usize> {
    let dir = data.datalogger.join(&ctx.pressure_data_source);
    if !dir.is_dir() {
        return Ok(0);
    }

    let prefix = format!("{}_", ctx.date().format("%Y-%m-%d"));
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) && name.ends_with(".dat") {
            return utils::count_lines(&entry.path());
        }
    }
    Ok(0)
}

fn profiles_exist(data: &DataConfig, model: AtmosphericProfileModel, ctx: &SensorDataContext) -> bool {
    let location = ProfilesLocation::from_coordinates(ctx.location.lat, ctx.location.lon);
    let dir = data.atmospheric_profiles.join(model.as_str());
    expected_filenames(model, location, ctx.date())
        .iter()
        .all(|name| dir.join(name).is_file())
}

/// `<algorithm>/<model>:<state>` of every job, `-` for a missing state.
fn output_states(retrieval: Option<&RetrievalConfig>, data: &DataConfig, ctx: &SensorDataContext) -> String {
    let retrieval = match retrieval {
        Some(retrieval) => retrieval,
        None => return "-".to_string(),
    };

    retrieval
        .jobs
        .iter()
        .map(|job| {
            let state = outputs::output_state(job, data, &ctx.sensor_id, ctx.date());
            format!("{}:{}", job.label(), state.map_or("-", |state| state.as_str()))
        })
        .collect::<Vec<_>>()
        .join(" ")
}
