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

//! The retrieval queue decides which (sensor, date) pair is processed next.
//!
//! Items come from two sources, in this order:
//!
//! 1. manual queue items with a priority > 0,
//! 2. dates found in the interferogram storage (newest first),
//! 3. manual queue items with a priority < 0.
//!
//! Every pair is handed out at most once per queue instance.

use super::{manual_queue, outputs};
use crate::{
    configuration::{DataConfig, RetrievalConfig, RetrievalJobConfig},
    constants::UPLOAD_META_FILE,
    metadata::{MetadataStore, SensorDataContext},
    utils,
};
use chrono::{Duration, NaiveDate};
use log::{debug, info, warn};
use rustc_hash::FxHashSet;
use serde::Deserialize;
use std::{fs, path::Path};

#[derive(Clone, PartialEq, Debug)]
struct QueueItem {
    priority: i32,
    context: SensorDataContext,
}

#[derive(Deserialize)]
struct UploadMeta {
    complete: bool,
}

#[derive(Debug)]
pub struct RetrievalQueue<'a> {
    config: &'a RetrievalConfig,
    job: &'a RetrievalJobConfig,
    data: &'a DataConfig,
    metadata: &'a MetadataStore,
    processed: FxHashSet<(String, NaiveDate)>,
    storage_items: Vec<QueueItem>,
    iteration_count: usize,
    verbose_reasoning: bool,
}

impl<'a> RetrievalQueue<'a> {
    /// Sets up the queue and precomputes the storage items.
    ///
    /// `today` bounds the considered dates together with
    /// `min_days_delay`. With `verbose_reasoning` the queue logs
    /// why it skips an item.
    pub fn new(
        config: &'a RetrievalConfig,
        job: &'a RetrievalJobConfig,
        data: &'a DataConfig,
        metadata: &'a MetadataStore,
        today: NaiveDate,
        verbose_reasoning: bool,
    ) -> Self {
        info!("Initializing RetrievalQueue of job {}", job.label());

        let mut queue = RetrievalQueue {
            config,
            job,
            data,
            metadata,
            processed: FxHashSet::default(),
            storage_items: vec![],
            iteration_count: 0,
            verbose_reasoning,
        };

        if config.data_sources.storage {
            debug!("Precomputing storage queue items");
            queue.storage_items = queue.collect_storage_items(today);
            debug!("{} storage items are waiting", queue.storage_items.len());
        }

        info!("RetrievalQueue is set up");
        queue
    }

    pub fn job(&self) -> &'a RetrievalJobConfig {
        self.job
    }

    /// Next context to process, `None` when there is nothing left.
    /// The returned pair is marked as processed.
    pub fn get_next_item(&mut self) -> Option<SensorDataContext> {
        self.iteration_count += 1;

        let next_manual_item = if self.config.data_sources.manual_queue {
            self.next_item_from_manual_queue()
        } else {
            None
        };

        let next_storage_item = if self.config.data_sources.storage {
            self.next_item_from_storage()
        } else {
            None
        };

        let (choice, source_label) = match (next_manual_item, next_storage_item) {
            (Some(manual), _) if manual.priority > 0 => (manual, "manual queue (high priority)"),
            (_, Some(storage)) => (storage, "storage directory"),
            (Some(manual), None) => (manual, "manual queue (low priority)"),
            (None, None) => return None,
        };

        info!(
            "{} iteration {} - using {} ({}/{})",
            self.job.label(),
            self.iteration_count,
            source_label,
            choice.context.sensor_id,
            choice.context.date()
        );

        self.mark_as_processed(&choice.context.sensor_id, choice.context.date());
        Some(choice.context)
    }

    fn collect_storage_items(&self, today: NaiveDate) -> Vec<QueueItem> {
        let filter = &self.job.storage_data_filter;
        let max_date = (today - Duration::days(i64::from(filter.min_days_delay))).min(filter.to_date);

        let mut items = vec![];

        for date in utils::date_range(filter.from_date, max_date).into_iter().rev() {
            for sensor_id in &filter.sensor_ids_to_consider {
                if outputs::outputs_exist(self.job, self.data, sensor_id, date) {
                    self.reason(sensor_id, date, "outputs exist");
                    continue;
                }
                if !self.ifgs_exist(sensor_id, date) {
                    self.reason(sensor_id, date, "ifgs do not exist");
                    continue;
                }
                if upload_is_incomplete(&self.data.interferograms, sensor_id, date) {
                    self.reason(sensor_id, date, "upload is incomplete");
                    continue;
                }

                match self.metadata.get_single(sensor_id, date) {
                    Ok(context) => items.push(QueueItem {
                        priority: 0,
                        context,
                    }),
                    Err(err) => self.reason(sensor_id, date, &err.to_string()),
                }
            }
        }

        items
    }

    fn next_item_from_storage(&self) -> Option<QueueItem> {
        self.storage_items
            .iter()
            .find(|item| !self.is_marked_as_processed(&item.context.sensor_id, item.context.date()))
            .cloned()
    }

    fn next_item_from_manual_queue(&mut self) -> Option<QueueItem> {
        // the file is re-read every time so that it can be edited
        // while the retrieval is running
        let items = match manual_queue::load(&self.config.manual_queue_file) {
            Ok(items) => items,
            Err(err) => {
                warn!("Manual queue could not be read: {}", err);
                return None;
            }
        };

        for item in items {
            if self.is_marked_as_processed(&item.sensor_id, item.date) {
                continue;
            }

            // not marked as processed, the upload might complete
            // while this queue is alive
            if upload_is_incomplete(&self.data.interferograms, &item.sensor_id, item.date) {
                self.reason(&item.sensor_id, item.date, "upload is incomplete");
                continue;
            }

            match self.metadata.get_single(&item.sensor_id, item.date) {
                Ok(context) => {
                    return Some(QueueItem {
                        priority: item.priority,
                        context,
                    })
                }
                Err(err) => {
                    debug!("Skipping manual queue item: {}", err);
                    self.mark_as_processed(&item.sensor_id, item.date);
                }
            }
        }

        None
    }

    fn mark_as_processed(&mut self, sensor_id: &str, date: NaiveDate) {
        self.processed.insert((sensor_id.to_string(), date));
    }

    fn is_marked_as_processed(&self, sensor_id: &str, date: NaiveDate) -> bool {
        self.processed.contains(&(sensor_id.to_string(), date))
    }

    fn ifgs_exist(&self, sensor_id: &str, date: NaiveDate) -> bool {
        self.data
            .interferograms
            .join(sensor_id)
            .join(utils::date_string(date))
            .is_dir()
    }

    fn reason(&self, sensor_id: &str, date: NaiveDate, reason: &str) {
        if self.verbose_reasoning {
            debug!("Skipping {}/{} because {}", sensor_id, date, reason);
        }
    }
}

/// An upload is incomplete only when its `upload-meta.json` says so.
pub fn upload_is_incomplete(ifg_root: &Path, sensor_id: &str, date: NaiveDate) -> bool {
    let meta_path = ifg_root
        .join(sensor_id)
        .join(utils::date_string(date))
        .join(UPLOAD_META_FILE);

    fs::read(meta_path)
        .ok()
        .and_then(|data| serde_json::from_slice::<UploadMeta>(&data).ok())
        .map_or(false, |meta| !meta.complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::outputs::OutputState;
    use crate::retrieval::test_support::{self, date, fixture, Fixture};

    fn add_ifg_dir(f: &Fixture, sensor_id: &str, d: NaiveDate) {
        fs::create_dir_all(f.data.interferograms.join(sensor_id).join(utils::date_string(d))).unwrap();
    }

    fn drain(queue: &mut RetrievalQueue) -> Vec<(String, NaiveDate)> {
        let mut result = vec![];
        while let Some(ctx) = queue.get_next_item() {
            result.push((ctx.sensor_id.clone(), ctx.date()));
        }
        result
    }

    #[test]
    fn storage_items_newest_first_with_dependency_checks() {
        let f = fixture();
        for d in 1..=6 {
            add_ifg_dir(&f, "ma", date(6, d));
            add_ifg_dir(&f, "mb", date(6, d));
        }

        // outputs exist
        fs::create_dir_all(outputs::output_dir(f.job(), &f.data, "ma", date(6, 4), OutputState::Failed)).unwrap();
        // upload incomplete
        fs::write(
            f.data.interferograms.join("ma/20220603").join(UPLOAD_META_FILE),
            r#"{"complete": false}"#,
        )
        .unwrap();
        // complete upload is fine
        fs::write(
            f.data.interferograms.join("ma/20220602").join(UPLOAD_META_FILE),
            r#"{"complete": true}"#,
        )
        .unwrap();

        // today - 5 days = 2022-06-05
        let mut queue = RetrievalQueue::new(&f.config, f.job(), &f.data, &f.metadata, date(6, 10), true);

        assert_eq!(
            drain(&mut queue),
            vec![
                ("ma".to_string(), date(6, 5)),
                ("mb".to_string(), date(6, 5)),
                ("mb".to_string(), date(6, 4)),
                ("mb".to_string(), date(6, 3)),
                ("ma".to_string(), date(6, 2)),
                ("ma".to_string(), date(6, 1)),
            ]
        );
        assert!(queue.get_next_item().is_none());
    }

    #[test]
    fn outputs_are_checked_per_job() {
        let mut f = fixture();
        f.config.jobs.push(test_support::job(&f.root, "proffast-2.4"));
        add_ifg_dir(&f, "ma", date(6, 5));
        fs::create_dir_all(outputs::output_dir(
            &f.config.jobs[0],
            &f.data,
            "ma",
            date(6, 5),
            OutputState::Successful,
        ))
        .unwrap();

        let mut first = RetrievalQueue::new(&f.config, &f.config.jobs[0], &f.data, &f.metadata, date(6, 10), false);
        let mut second = RetrievalQueue::new(&f.config, &f.config.jobs[1], &f.data, &f.metadata, date(6, 10), false);

        assert!(drain(&mut first).is_empty());
        assert_eq!(drain(&mut second), vec![("ma".to_string(), date(6, 5))]);
        assert_eq!(second.job().label(), "proffast-2.4/GGG2014");
    }

    #[test]
    fn manual_priorities_around_storage() {
        let f = fixture();
        add_ifg_dir(&f, "ma", date(6, 5));
        fs::write(
            &f.config.manual_queue_file,
            r#"[
                {"sensor_id": "ma", "date": "2022-03-01", "priority": -1},
                {"sensor_id": "ma", "date": "2022-02-01", "priority": 3},
                {"sensor_id": "mb", "date": "2022-01-01", "priority": 5},
                {"sensor_id": "ma", "date": "2022-06-05", "priority": 1}
            ]"#,
        )
        .unwrap();

        let mut queue = RetrievalQueue::new(&f.config, f.job(), &f.data, &f.metadata, date(6, 10), false);

        // mb has no location on 2022-01-01 and is dropped,
        // ma/2022-06-05 is both in manual queue and storage
        // but only handed out once
        assert_eq!(
            drain(&mut queue),
            vec![
                ("ma".to_string(), date(2, 1)),
                ("ma".to_string(), date(6, 5)),
                ("ma".to_string(), date(3, 1)),
            ]
        );
    }

    #[test]
    fn incomplete_manual_item_is_retried() {
        let f = fixture();
        let ifg_dir = f.data.interferograms.join("ma/20220201");
        fs::create_dir_all(&ifg_dir).unwrap();
        fs::write(ifg_dir.join(UPLOAD_META_FILE), r#"{"complete": false}"#).unwrap();
        fs::write(
            &f.config.manual_queue_file,
            r#"[{"sensor_id": "ma", "date": "2022-02-01", "priority": 1}]"#,
        )
        .unwrap();

        let mut config = f.config.clone();
        config.data_sources.storage = false;
        let mut queue = RetrievalQueue::new(&config, f.job(), &f.data, &f.metadata, date(6, 10), false);

        assert!(queue.get_next_item().is_none());

        fs::write(ifg_dir.join(UPLOAD_META_FILE), r#"{"complete": true}"#).unwrap();
        let ctx = queue.get_next_item().unwrap();
        assert_eq!(ctx.date(), date(2, 1));
        assert!(queue.get_next_item().is_none());
    }

    #[test]
    fn unreadable_upload_meta_counts_as_complete() {
        let f = fixture();
        let ifg_dir = f.root.join("ifg/ma/20220601");
        fs::create_dir_all(&ifg_dir).unwrap();
        fs::write(ifg_dir.join(UPLOAD_META_FILE), "not json").unwrap();

        assert!(!upload_is_incomplete(&f.data.interferograms, "ma", date(6, 1)));
        assert!(!upload_is_incomplete(&f.data.interferograms, "ma", date(6, 2)));
    }
}
