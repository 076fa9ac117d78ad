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

//! Manual overrides of the retrieval queue.
//!
//! The manual queue file is a JSON list of `{ sensor_id, date, priority }`.
//! Items with a positive priority are processed before the storage items,
//! items with a negative priority only after the storage is exhausted.

use crate::errors::QueueError;
use chrono::NaiveDate;
use log::warn;
use serde::{Deserialize, Serialize};
use std::{fs, io, path::Path};

#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct ManualQueueItem {
    pub sensor_id: String,
    pub date: NaiveDate,
    pub priority: i32,
}

/// Reads the queue, highest priority first. Items with equal priority
/// keep their order from the file. A missing file is an empty queue.
pub fn load(path: &Path) -> Result<Vec<ManualQueueItem>, QueueError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(err.into()),
    };

    let items: Vec<ManualQueueItem> = serde_json::from_slice(&data)?;

    let mut items: Vec<ManualQueueItem> = items
        .into_iter()
        .filter(|item| {
            if item.priority == 0 {
                warn!(
                    "Ignoring manual queue item {}/{} with priority 0",
                    item.sensor_id, item.date
                );
            }
            item.priority != 0
        })
        .collect();

    items.sort_by(|a, b| b.priority.cmp(&a.priority));

    Ok(items)
}

/// Removes every item of the (sensor, date) pair from the file.
/// Does nothing when the file does not exist.
pub fn remove_item(path: &Path, sensor_id: &str, date: NaiveDate) -> Result<(), QueueError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    let items: Vec<ManualQueueItem> = serde_json::from_slice(&data)?;
    let count = items.len();
    let remaining: Vec<ManualQueueItem> = items
        .into_iter()
        .filter(|item| !(item.sensor_id == sensor_id && item.date == date))
        .collect();

    if remaining.len() != count {
        fs::write(path, serde_json::to_string_pretty(&remaining)?)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2017, 1, d).unwrap()
    }

    fn write_queue(path: &Path) {
        fs::write(
            path,
            r#"[
                {"sensor_id": "so", "date": "2017-01-02", "priority": -1},
                {"sensor_id": "so", "date": "2017-01-01", "priority": 1},
                {"sensor_id": "mc", "date": "2017-01-04", "priority": 0},
                {"sensor_id": "so", "date": "2017-01-03", "priority": 1},
                {"sensor_id": "mc", "date": "2017-01-05", "priority": 7}
            ]"#,
        )
        .unwrap();
    }

    #[test]
    fn sorted_by_priority() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manual-queue.json");
        write_queue(&path);

        let items = load(&path).unwrap();
        let order: Vec<(&str, NaiveDate)> = items
            .iter()
            .map(|i| (i.sensor_id.as_str(), i.date))
            .collect();

        assert_eq!(
            order,
            vec![
                ("mc", date(5)),
                ("so", date(1)),
                ("so", date(3)),
                ("so", date(2)),
            ]
        );
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manual-queue.json");

        assert!(load(&path).unwrap().is_empty());
        remove_item(&path, "so", date(1)).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn remove_single_item() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manual-queue.json");
        write_queue(&path);

        remove_item(&path, "so", date(1)).unwrap();
        let items = load(&path).unwrap();

        assert_eq!(items.len(), 3);
        assert!(!items.iter().any(|i| i.sensor_id == "so" && i.date == date(1)));
    }
}
