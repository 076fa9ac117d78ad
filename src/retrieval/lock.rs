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

//! Lock file of the running scheduler and its stop request.
//!
//! `retrieval.lock` inside the containers directory holds the pid of the
//! scheduler owning the directory. A lock whose process is gone is stale
//! and is taken over by the next scheduler. `retrieval.stop` asks the
//! running scheduler to cancel its jobs and exit.

use crate::errors::PipelineError;
use log::warn;
use nix::{
    errno::Errno,
    sys::signal::kill,
    unistd::Pid,
};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

const LOCK_FILE: &str = "retrieval.lock";
const STOP_FILE: &str = "retrieval.stop";

/// Log of schedulers started in the background.
pub const BACKGROUND_LOG_FILE: &str = "retrieval.log";

/// Lock held for the whole lifetime of one scheduler.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(dir: &Path) -> Result<Self, PipelineError> {
        fs::create_dir_all(dir)?;
        let path = lock_path(dir);

        if try_create(&path)? {
            return Ok(LockFile { path });
        }

        if let Some(pid) = running_pid(dir) {
            return Err(PipelineError::AlreadyRunning(path, pid));
        }

        warn!("Removing stale lock file {}", path.display());
        remove_if_exists(&path)?;

        // another scheduler may have taken over in between
        if try_create(&path)? {
            Ok(LockFile { path })
        } else {
            let pid = read_pid(&path).unwrap_or_default();
            Err(PipelineError::AlreadyRunning(path, pid))
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("Could not remove lock file {}: {}", self.path.display(), err);
        }
    }
}

pub fn lock_path(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILE)
}

fn try_create(path: &Path) -> io::Result<bool> {
    match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            write!(file, "{}", std::process::id())?;
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Signal 0 only checks whether the process exists. `EPERM` means it
/// exists but belongs to another user.
pub fn process_is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// Pid of the scheduler holding the lock, `None` when there is no lock
/// or the lock is stale.
pub fn running_pid(dir: &Path) -> Option<i32> {
    read_pid(&lock_path(dir)).filter(|pid| process_is_alive(*pid))
}

/// Removes the lock file when its process is gone.
pub fn remove_stale_lock(dir: &Path) -> io::Result<bool> {
    let path = lock_path(dir);
    if !path.exists() || running_pid(dir).is_some() {
        return Ok(false);
    }
    warn!("Removing stale lock file {}", path.display());
    remove_if_exists(&path)?;
    Ok(true)
}

pub fn request_stop(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(STOP_FILE), "")
}

pub fn stop_requested(dir: &Path) -> bool {
    dir.join(STOP_FILE).exists()
}

pub fn clear_stop_request(dir: &Path) -> io::Result<()> {
    remove_if_exists(&dir.join(STOP_FILE))
}
