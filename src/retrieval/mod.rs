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

//! Module containing the automated retrieval.
//!
//! The scheduler takes (sensor, date) pairs from one [`queue::RetrievalQueue`]
//! per configured job, creates a private container for each of them and
//! deploys the sessions onto a threadpool. Each session prepares the
//! container inputs, runs the retrieval program, evaluates and archives its
//! outputs. The scheduler thread is the only one touching the manual queue
//! file, the status store and the container registry.

pub mod container;
pub mod lock;
pub mod manual_queue;
pub mod outputs;
pub mod process;
pub mod queue;
pub mod session;
pub mod status;

#[cfg(test)]
pub(crate) mod test_support;

use crate::{
    configuration::{Config, DataConfig, RetrievalConfig, RetrievalJobConfig},
    constants::STOP_TIMEOUT_SECONDS,
    errors::{PipelineError, SessionError},
    metadata::{MetadataStore, SensorDataContext},
};
use chrono::{NaiveDate, Utc};
use container::ContainerFactory;
use lock::LockFile;
use log::{debug, error, info, warn};
use outputs::RetrievalOutcome;
use queue::RetrievalQueue;
use rayon::{ThreadPool, ThreadPoolBuilder};
use rustc_hash::FxHashMap;
use session::{RetrievalSession, SessionLog};
use status::{ProcessState, StatusStore};
use std::{
    fs,
    os::unix::process::CommandExt,
    path::Path,
    process::{Command, Stdio},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

/// Result of one session as sent back to the scheduler.
#[derive(Debug)]
struct JobReport {
    container_id: String,
    result: Result<RetrievalOutcome, SessionError>,
}

/// State of the scheduler thread while sessions are running.
struct Scheduler<'a> {
    config: &'a RetrievalConfig,
    shared_config: Arc<RetrievalConfig>,
    shared_data: Arc<DataConfig>,
    factory: ContainerFactory,
    status: StatusStore,
    threadpool: ThreadPool,
    tx: Sender<JobReport>,
    rx: Receiver<JobReport>,
    active_sessions: FxHashMap<String, RetrievalSession>,
    processed_items: Vec<(String, NaiveDate)>,
    finished_count: usize,
}

impl<'a> Scheduler<'a> {
    fn new(config: &'a RetrievalConfig, data: &DataConfig) -> Result<Self, PipelineError> {
        let factory = ContainerFactory::new(config)?;

        let mut status = StatusStore::load(&config.status_file)?;
        status.reset()?;

        debug!("Setting up ThreadPool");
        let threadpool = ThreadPoolBuilder::new()
            .num_threads(config.max_process_count)
            .build()?;

        let (tx, rx) = mpsc::channel();

        Ok(Scheduler {
            config,
            shared_config: Arc::new(config.clone()),
            shared_data: Arc::new(data.clone()),
            factory,
            status,
            threadpool,
            tx,
            rx,
            active_sessions: FxHashMap::default(),
            processed_items: vec![],
            finished_count: 0,
        })
    }

    fn has_free_slot(&self) -> bool {
        self.active_sessions.len() < self.config.max_process_count
    }

    /// Creates the container of the session and deploys it onto the threadpool.
    fn dispatch(&mut self, job: &RetrievalJobConfig, context: SensorDataContext) -> Result<(), PipelineError> {
        let session = RetrievalSession {
            context,
            container: self.factory.create_container(job)?,
            job: job.clone(),
        };
        let container_id = session.container.container_id.clone();

        if let Err(err) = self
            .status
            .add_item(job, &session.context.sensor_id, session.date(), &container_id)
        {
            error!("Could not write status of {}: {}", session.label(), err);
        }
        info!("Scheduling {}", session.label());
        debug!("Active containers: {}", self.factory.container_ids().join(", "));

        self.active_sessions.insert(container_id.clone(), session.clone());

        let tx = self.tx.clone();
        let config = Arc::clone(&self.shared_config);
        let data = Arc::clone(&self.shared_data);

        self.threadpool.spawn(move || {
            let report = JobReport {
                container_id,
                result: run_job(&session, &config, &data),
            };
            if tx.send(report).is_err() {
                error!("Scheduler is gone, dropping report of {}", session.label());
            }
        });

        Ok(())
    }

    /// Waits up to `timeout` for one finished session.
    fn collect(&mut self, timeout: Duration) {
        match self.rx.recv_timeout(timeout) {
            Ok(report) => self.finish_job(report),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => {
                error!("All workers are gone, abandoning {} sessions", self.active_sessions.len());
                self.active_sessions.clear();
            }
        }
    }

    /// Waits for every running session.
    fn drain(&mut self) {
        if !self.active_sessions.is_empty() {
            info!("Waiting for {} running sessions", self.active_sessions.len());
        }
        while !self.active_sessions.is_empty() {
            self.collect(Duration::from_millis(self.config.poll_interval_ms));
        }
    }

    /// Bookkeeping of one finished session. Errors are logged so that
    /// one broken file does not leave other sessions behind.
    fn finish_job(&mut self, report: JobReport) {
        let session = match self.active_sessions.remove(&report.container_id) {
            Some(session) => session,
            None => {
                warn!("Received report of unknown container {}", report.container_id);
                return;
            }
        };
        let container_id = &session.container.container_id;

        let (state, reason) = match &report.result {
            Ok(RetrievalOutcome::Succeeded) => {
                info!("{} - retrieval succeeded", session.label());
                (ProcessState::Succeeded, None)
            }
            Ok(RetrievalOutcome::Failed { reason }) => {
                warn!(
                    "{} - retrieval failed ({})",
                    session.label(),
                    reason.as_deref().unwrap_or("unknown reason")
                );
                (ProcessState::Failed, reason.clone())
            }
            Err(SessionError::Cancelled) => {
                warn!("{} - cancelled", session.label());
                (ProcessState::Cancelled, None)
            }
            Err(err) => {
                error!("{} - session could not be completed: {}", session.label(), err);
                (ProcessState::Failed, Some(err.to_string()))
            }
        };

        if let Err(err) = self.status.mark_finished(container_id, state, reason) {
            error!("Could not write status of {}: {}", session.label(), err);
        }
        if report.result.is_ok() {
            self.processed_items
                .push((session.context.sensor_id.clone(), session.date()));
        }
        if let Err(err) = self.factory.remove_container(container_id) {
            error!("Could not remove container {}: {}", container_id, err);
        }

        self.finished_count += 1;
    }

    /// Removes processed items from the manual queue and every container.
    fn shutdown(mut self) {
        self.processed_items.sort();
        self.processed_items.dedup();
        for (sensor_id, date) in &self.processed_items {
            if let Err(err) = manual_queue::remove_item(&self.config.manual_queue_file, sensor_id, *date) {
                warn!("Could not remove {}/{} from the manual queue: {}", sensor_id, date, err);
            }
        }

        if let Err(err) = self.factory.remove_all_containers(false) {
            error!("Could not remove containers: {}", err);
        }
        info!("{} sessions finished", self.finished_count);
    }
}

/// Main retrieval function, running the scheduler in the foreground
/// until all queues are exhausted or a stop is requested.
pub fn main(config: &Config) -> Result<(), PipelineError> {
    let retrieval = config.retrieval()?;
    let metadata = MetadataStore::load(&config.general.metadata_dir)?;

    run_scheduler(retrieval, &config.general.data, &metadata, Utc::now().date_naive())
}

pub fn run_scheduler(
    config: &RetrievalConfig,
    data: &DataConfig,
    metadata: &MetadataStore,
    today: NaiveDate,
) -> Result<(), PipelineError> {
    info!("Preparing the retrieval scheduler");

    let _lock = LockFile::acquire(&config.containers_dir)?;
    lock::clear_stop_request(&config.containers_dir)?;

    let mut scheduler = Scheduler::new(config, data)?;
    let mut queues: Vec<RetrievalQueue> = config
        .jobs
        .iter()
        .map(|job| RetrievalQueue::new(config, job, data, metadata, today, false))
        .collect();

    let result = schedule(&mut scheduler, &mut queues);
    if let Err(err) = &result {
        error!("Scheduler failed: {}", err);
    }

    scheduler.drain();
    scheduler.shutdown();

    if lock::stop_requested(&config.containers_dir) {
        info!("Scheduler stopped on request");
    }
    lock::clear_stop_request(&config.containers_dir)?;

    result
}

/// The jobs are worked off one after another; a job's queue is only
/// left once it yields no more items.
fn schedule(scheduler: &mut Scheduler, queues: &mut [RetrievalQueue]) -> Result<(), PipelineError> {
    let poll_interval = Duration::from_millis(scheduler.config.poll_interval_ms);
    let mut current = 0;

    loop {
        if lock::stop_requested(&scheduler.config.containers_dir) {
            info!("Stop requested, no more sessions are scheduled");
            return Ok(());
        }

        // fill all free process slots
        while scheduler.has_free_slot() && current < queues.len() {
            match queues[current].get_next_item() {
                Some(context) => scheduler.dispatch(queues[current].job(), context)?,
                None => {
                    info!("Retrieval queue of {} is empty", queues[current].job().label());
                    current += 1;
                }
            }
        }

        if scheduler.active_sessions.is_empty() {
            return Ok(());
        }

        scheduler.collect(poll_interval);
    }
}

/// Everything happening with one session on a worker thread.
///
/// Failures of input preparation or of the retrieval program are
/// archived as failed outputs. Cancelled sessions are not archived.
/// The interferogram permissions are restored in any case.
fn run_job(
    session: &RetrievalSession,
    config: &RetrievalConfig,
    data: &DataConfig,
) -> Result<RetrievalOutcome, SessionError> {
    let mut log = SessionLog::new(session);
    log.info(&format!(
        "Starting retrieval at location {} ({}, {})",
        session.context.location.location_id,
        session.context.location.lat,
        session.context.location.lon
    ));

    let outcome = match session::prepare_inputs(session, config, data, &mut log)
        .and_then(|_| process::run(session, config, &mut log))
    {
        Ok(exited_cleanly) => {
            if !exited_cleanly {
                log.warn("Retrieval process exited with an error");
            }
            outputs::evaluate(session)
        }
        Err(SessionError::Cancelled) => Err(SessionError::Cancelled),
        Err(err) => {
            log.warn(&format!("Retrieval could not run: {}", err));
            Ok(RetrievalOutcome::Failed {
                reason: Some(err.to_string()),
            })
        }
    };

    let archived = outcome.and_then(|outcome| {
        outputs::archive(session, &outcome, data, &mut log)?;
        Ok(outcome)
    });

    let restored = session::restore_ifg_permissions(session, config, data, &mut log);
    if let Err(err) = &restored {
        log.warn(&format!("Could not restore ifg permissions: {}", err));
    }

    let outcome = archived?;
    match restored {
        Err(err) if config.ifg_file_permissions.fail_on_permission_error => Err(err),
        _ => Ok(outcome),
    }
}

/// Dry run of the queues: lists the next `limit` items of every job
/// and logs why others are skipped.
pub fn preview_queue(
    config: &Config,
    limit: usize,
) -> Result<Vec<(String, SensorDataContext)>, PipelineError> {
    let retrieval = config.retrieval()?;
    let metadata = MetadataStore::load(&config.general.metadata_dir)?;
    let today = Utc::now().date_naive();

    let mut items = vec![];
    for job in &retrieval.jobs {
        let mut queue = RetrievalQueue::new(retrieval, job, &config.general.data, &metadata, today, true);
        for _ in 0..limit {
            match queue.get_next_item() {
                Some(context) => items.push((job.label(), context)),
                None => break,
            }
        }
    }

    Ok(items)
}

/// Status items of the currently or last running scheduler.
pub fn read_status(config: &Config) -> Result<Vec<status::RetrievalStatus>, PipelineError> {
    let retrieval = config.retrieval()?;
    Ok(StatusStore::load(&retrieval.status_file)?.items().to_vec())
}

/// Pid of the running scheduler, if any.
pub fn is_running(config: &RetrievalConfig) -> Option<i32> {
    lock::running_pid(&config.containers_dir)
}

/// Starts `retrieval run` as a detached background process writing
/// into `<containers_dir>/retrieval.log` and returns its pid.
pub fn start(config: &RetrievalConfig, config_path: &Path) -> Result<u32, PipelineError> {
    if let Some(pid) = is_running(config) {
        return Err(PipelineError::AlreadyRunning(
            lock::lock_path(&config.containers_dir),
            pid,
        ));
    }

    fs::create_dir_all(&config.containers_dir)?;
    let logfile = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.containers_dir.join(lock::BACKGROUND_LOG_FILE))?;

    let child = Command::new(std::env::current_exe()?)
        .arg("--config")
        .arg(config_path)
        .args(["retrieval", "run"])
        .stdin(Stdio::null())
        .stdout(logfile.try_clone()?)
        .stderr(logfile)
        .process_group(0)
        .spawn()?;

    info!("Started retrieval scheduler with pid {}", child.id());
    Ok(child.id())
}

/// Asks the running scheduler to cancel its sessions and waits until it
/// has released the lock.
pub fn stop(config: &RetrievalConfig) -> Result<(), PipelineError> {
    let dir = &config.containers_dir;

    let pid = match lock::running_pid(dir) {
        Some(pid) => pid,
        None => {
            if lock::remove_stale_lock(dir)? {
                info!("Scheduler was not running, removed its stale lock");
            } else {
                info!("Scheduler is not running");
            }
            return Ok(());
        }
    };

    info!("Requesting scheduler {} to stop", pid);
    lock::request_stop(dir)?;

    let started = Instant::now();
    while lock::running_pid(dir) == Some(pid) {
        if started.elapsed() > Duration::from_secs(STOP_TIMEOUT_SECONDS) {
            return Err(PipelineError::StopTimeout(pid, STOP_TIMEOUT_SECONDS));
        }
        thread::sleep(Duration::from_millis(config.poll_interval_ms));
    }

    info!("Scheduler {} stopped", pid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::IfgFilePermissions;
    use crate::retrieval::session::tests::write_inputs;
    use crate::retrieval::test_support::{date, fixture};
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn archive_failure_still_restores_permissions() {
        let mut f = fixture();
        f.config.ifg_file_permissions = IfgFilePermissions {
            during_processing: Some("r--r--r--".to_string()),
            after_processing: Some("rw-r--r--".to_string()),
            fail_on_permission_error: true,
        };
        write_inputs(&f, "ma", date(6, 2), 1441);
        // results cannot become a directory
        fs::write(&f.data.results, "not a directory").unwrap();

        let session = f.session("ma", date(6, 2));
        assert!(run_job(&session, &f.config, &f.data).is_err());

        let ifg = f.data.interferograms.join("ma/20220602/ma20220602.ifg.0001");
        assert_eq!(fs::metadata(&ifg).unwrap().permissions().mode() & 0o777, 0o644);
    }

    #[test]
    fn cancelled_sessions_are_not_archived() {
        let mut f = fixture();
        f.config.jobs[0].command = vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 5".to_string()];
        write_inputs(&f, "ma", date(6, 2), 1441);
        lock::request_stop(&f.config.containers_dir).unwrap();

        let session = f.session("ma", date(6, 2));
        assert!(matches!(
            run_job(&session, &f.config, &f.data),
            Err(SessionError::Cancelled)
        ));
        assert_eq!(outputs::output_state(f.job(), &f.data, "ma", date(6, 2)), None);
    }

    #[test]
    fn stop_without_scheduler() {
        let f = fixture();
        assert_eq!(is_running(&f.config), None);
        assert!(stop(&f.config).is_ok());
        assert!(!lock::stop_requested(&f.config.containers_dir));
    }
}
