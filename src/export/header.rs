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

use crate::{
    configuration::ExportTargetConfig,
    constants::PIPELINE_REPOSITORY,
    metadata::{CampaignMetadata, MetadataStore, SensorDataContext},
    utils,
};
use chrono::{NaiveDate, Utc};

/// Description of the campaign day written above the exported csv.
pub fn get_header(
    metadata: &MetadataStore,
    campaign: &CampaignMetadata,
    contexts: &[SensorDataContext],
    target: &ExportTargetConfig,
    date: NaiveDate,
) -> String {
    let data_types: Vec<&str> = target.data_types.iter().map(|dt| dt.as_str()).collect();

    let mut lines = vec![
        "FILE GENERATION:".to_string(),
        format!("    retrieval software:     {}", target.retrieval_algorithm),
        format!("    meteorological model:   {}", target.atmospheric_profile_model),
        format!("    file generated by:      {}", PIPELINE_REPOSITORY),
        format!(
            "    pipeline commit sha:    {}",
            utils::commit_sha().unwrap_or_else(|| "unknown".to_string())
        ),
        format!("    pipeline version:       {}", env!("CARGO_PKG_VERSION")),
        format!("    file generated at:      {}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ")),
        String::new(),
        "FILE CONTENT:".to_string(),
        format!("    campaign id:            {}", campaign.campaign_id),
        format!("    campaign sensor ids:    {}", campaign.sensor_ids.join(", ")),
        format!("    campaign location ids:  {}", campaign.location_ids.join(", ")),
        format!("    date:                   {}", date.format("%Y-%m-%d")),
        format!("    data types:             {}", data_types.join(", ")),
        format!("    sampling rate:          {}", target.sampling_rate),
        String::new(),
        "SENSOR SERIAL NUMBERS:".to_string(),
    ];

    for sensor_id in &campaign.sensor_ids {
        if let Ok(sensor) = metadata.sensor(sensor_id) {
            lines.push(format!("    {:<10}{}", format!("{}: ", sensor_id), sensor.serial_number));
        }
    }
    lines.push(String::new());

    lines.push("LOCATION COORDINATES [lat, lon, alt]:".to_string());
    for location_id in &campaign.location_ids {
        if let Some(location) = metadata.location(location_id) {
            lines.push(format!(
                "    {:<10}{}, {}, {}",
                format!("{}: ", location_id),
                location.lat,
                location.lon,
                location.alt
            ));
        }
    }
    lines.push(String::new());

    lines.push("SENSOR LOCATIONS:".to_string());
    for sensor_id in &campaign.sensor_ids {
        let location_ids: Vec<&str> = contexts
            .iter()
            .filter(|ctx| &ctx.sensor_id == sensor_id)
            .map(|ctx| ctx.location.location_id.as_str())
            .collect();
        if location_ids.is_empty() {
            lines.push(format!("    {}: no data", sensor_id));
        } else {
            lines.push(format!("    {}: {}", sensor_id, location_ids.join(", ")));
        }
    }
    lines.push(String::new());

    let mut header: String = lines.iter().map(|line| format!("## {}\n", line)).collect();
    header.push_str(&"#".repeat(80));
    header.push('\n');
    header
}
