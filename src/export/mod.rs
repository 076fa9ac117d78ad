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

//! Module merging the retrieval outputs of a campaign into
//! one csv file per day.

pub mod dataframe;
pub mod header;

use crate::{
    configuration::{Config, DataConfig, ExportTargetConfig},
    errors::{ExportError, PipelineError},
    metadata::{MetadataStore, SensorDataContext},
    retrieval::outputs::{self, OutputState},
    utils,
};
use chrono::{NaiveDate, Utc};
use dataframe::SensorFrame;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use std::{
    fs,
    io::{BufWriter, Write},
    path::PathBuf,
};

pub fn main(config: &Config) -> Result<(), PipelineError> {
    let metadata = MetadataStore::load(&config.general.metadata_dir)?;
    let today = Utc::now().date_naive();

    if config.export_targets.is_empty() {
        info!("No export targets configured");
    }

    for (i, target) in config.export_targets.iter().enumerate() {
        info!(
            "Processing export target #{} (campaign {}, {}/{})",
            i + 1,
            target.campaign_id,
            target.retrieval_algorithm,
            target.atmospheric_profile_model
        );
        let written = export_target(target, &config.general.data, &metadata, today)?;
        info!("Wrote {} files to {}", written.len(), target.dst_dir.display());
    }

    Ok(())
}

/// Exports every campaign day up to `today`. Days without
/// any successful output produce no file.
pub fn export_target(
    target: &ExportTargetConfig,
    data: &DataConfig,
    metadata: &MetadataStore,
    today: NaiveDate,
) -> Result<Vec<PathBuf>, PipelineError> {
    let campaign = metadata.campaign(&target.campaign_id)?;
    let dates = utils::date_range(
        campaign.from_datetime.date_naive(),
        campaign.to_datetime.date_naive().min(today),
    );

    fs::create_dir_all(&target.dst_dir)?;

    let dates_bar = ProgressBar::new(dates.len() as u64);
    dates_bar.set_style(
        ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
            .progress_chars("#>-"),
    );
    dates_bar.set_prefix("Exported days");

    let mut written = vec![];

    for date in dates {
        let mut contexts = vec![];
        for sensor_id in &campaign.sensor_ids {
            contexts.extend(
                metadata
                    .get(sensor_id, date)?
                    .into_iter()
                    .filter(|ctx| campaign.location_ids.contains(&ctx.location.location_id)),
            );
        }

        let mut frames = vec![];
        for ctx in &contexts {
            if let Some(frame) = sensor_frame(target, data, ctx)? {
                frames.push((ctx.sensor_id.clone(), frame));
            }
        }

        if !frames.is_empty() {
            debug!("{}: {} sensor context(s) with data", date, frames.len());

            let merged = dataframe::merge(&frames);
            let path = target.dst_dir.join(format!(
                "{}_em27_export_{}.csv",
                target.campaign_id,
                utils::date_string(date)
            ));

            let mut file = BufWriter::new(fs::File::create(&path)?);
            file.write_all(header::get_header(metadata, campaign, &contexts, target, date).as_bytes())?;
            dataframe::write_csv(&mut file, &merged)?;
            file.flush()?;

            written.push(path);
        }

        dates_bar.inc(1);
    }

    dates_bar.finish_with_message("All days exported");
    Ok(written)
}

/// Resampled data of one context, `None` when there is no
/// successful output for it.
fn sensor_frame(
    target: &ExportTargetConfig,
    data: &DataConfig,
    ctx: &SensorDataContext,
) -> Result<Option<SensorFrame>, ExportError> {
    let results = outputs::results_dir(
        data,
        &target.retrieval_algorithm,
        target.atmospheric_profile_model,
        &ctx.sensor_id,
        ctx.date(),
        OutputState::Successful,
    );
    if !results.is_dir() {
        return Ok(None);
    }

    let csv_path = match outputs::find_file(&results, &outputs::output_csv_name(ctx))? {
        Some(path) => path,
        None => return Ok(None),
    };

    let frame = dataframe::read_output_csv(&csv_path, ctx, &target.data_types)?;
    if frame.is_empty() {
        return Ok(None);
    }

    let resampled = dataframe::resample(
        &frame,
        target.sampling_rate.seconds(),
        i64::from(target.max_interpolation_gap_seconds),
    );
    debug!(
        "{}/{}: {} rows resampled to {}",
        ctx.sensor_id,
        ctx.date(),
        frame.len(),
        resampled.len()
    );

    Ok(Some(resampled))
}
