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

//! Persistent record of the scheduled and finished retrieval jobs.

use crate::{
    configuration::{AtmosphericProfileModel, RetrievalJobConfig},
    errors::QueueError,
};
use chrono::{DateTime, NaiveDate, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Scheduled,
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            ProcessState::Scheduled => "scheduled",
            ProcessState::Succeeded => "succeeded",
            ProcessState::Failed => "failed",
            ProcessState::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct RetrievalStatus {
    pub retrieval_algorithm: String,
    pub atmospheric_profile_model: AtmosphericProfileModel,
    pub sensor_id: String,
    pub date: NaiveDate,
    pub container_id: String,
    pub state: ProcessState,
    #[serde(default)]
    pub error: Option<String>,
    pub process_start_time: DateTime<Utc>,
    #[serde(default)]
    pub process_end_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct StatusStore {
    path: PathBuf,
    items: Vec<RetrievalStatus>,
}

impl StatusStore {
    /// Reads the status file, a missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self, QueueError> {
        let items = match fs::read(path) {
            Ok(data) => serde_json::from_slice(&data).map_err(QueueError::Status)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => vec![],
            Err(err) => return Err(err.into()),
        };

        Ok(StatusStore {
            path: path.to_path_buf(),
            items,
        })
    }

    pub fn items(&self) -> &[RetrievalStatus] {
        &self.items
    }

    pub fn add_item(
        &mut self,
        job: &RetrievalJobConfig,
        sensor_id: &str,
        date: NaiveDate,
        container_id: &str,
    ) -> Result<(), QueueError> {
        self.items.push(RetrievalStatus {
            retrieval_algorithm: job.retrieval_algorithm.clone(),
            atmospheric_profile_model: job.atmospheric_profile_model,
            sensor_id: sensor_id.to_string(),
            date,
            container_id: container_id.to_string(),
            state: ProcessState::Scheduled,
            error: None,
            process_start_time: Utc::now(),
            process_end_time: None,
        });
        self.save()
    }

    /// Marks the job running in the given container as finished.
    pub fn mark_finished(
        &mut self,
        container_id: &str,
        state: ProcessState,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        match self
            .items
            .iter_mut()
            .find(|item| item.container_id == container_id && item.state == ProcessState::Scheduled)
        {
            Some(item) => {
                item.state = state;
                item.error = error;
                item.process_end_time = Some(Utc::now());
            }
            None => debug!("No scheduled status item for container {}", container_id),
        }
        self.save()
    }

    /// Drops all items of earlier runs.
    pub fn reset(&mut self) -> Result<(), QueueError> {
        self.items.clear();
        self.save()
    }

    fn save(&self) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(&self.items).map_err(QueueError::Status)?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}
