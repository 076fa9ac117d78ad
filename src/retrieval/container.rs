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

//! Factory for the retrieval containers.
//!
//! A container is a private working directory for exactly one retrieval
//! job. It consists of a copy of the retrieval code, an input directory
//! (`ifg/`, `map/`, `log/`) and an output directory. Containers never
//! share any writable files, so any number of them can run in parallel.
//!
//! The factory keeps track of all containers it created and can remove
//! them again.

use crate::{
    configuration::{RetrievalConfig, RetrievalJobConfig},
    constants::{CONTAINER_ID_LENGTH, CONTAINER_PREFIX},
    errors::ContainerError,
    utils,
};
use log::{debug, info};
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RetrievalContainer {
    pub container_id: String,
    pub container_path: PathBuf,
    pub data_input_path: PathBuf,
    pub data_output_path: PathBuf,
}

impl RetrievalContainer {
    fn new(containers_dir: &Path, container_id: String) -> Self {
        let base = format!("{}-{}", CONTAINER_PREFIX, container_id);
        RetrievalContainer {
            container_path: containers_dir.join(&base),
            data_input_path: containers_dir.join(format!("{}-inputs", base)),
            data_output_path: containers_dir.join(format!("{}-outputs", base)),
            container_id,
        }
    }

    fn remove_directories(&self) -> Result<(), ContainerError> {
        for dir in [
            &self.container_path,
            &self.data_input_path,
            &self.data_output_path,
        ] {
            if dir.exists() {
                fs::remove_dir_all(dir)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ContainerFactory {
    containers_dir: PathBuf,
    containers: Vec<RetrievalContainer>,
}

impl ContainerFactory {
    /// Sets up the factory and removes every leftover
    /// container of earlier runs.
    pub fn new(config: &RetrievalConfig) -> Result<Self, ContainerError> {
        for job in &config.jobs {
            let main_dir = job.code_dir.join("main");
            if !main_dir.is_dir() {
                return Err(ContainerError::MissingCode(main_dir));
            }
        }

        fs::create_dir_all(&config.containers_dir)?;

        let mut factory = ContainerFactory {
            containers_dir: config.containers_dir.clone(),
            containers: vec![],
        };

        info!("Removing all old containers");
        factory.remove_all_containers(true)?;

        info!("ContainerFactory is set up");
        Ok(factory)
    }

    /// Creates a new container with a unique id for the given job.
    ///
    /// The retrieval code is copied from `<code_dir>/main` and the
    /// optional `<code_dir>/install.sh` is run with `/bin/sh` inside the copy.
    pub fn create_container(&mut self, job: &RetrievalJobConfig) -> Result<RetrievalContainer, ContainerError> {
        let used_ids: Vec<String> = self
            .containers
            .iter()
            .map(|c| c.container_id.clone())
            .collect();
        let container_id = utils::random_string(CONTAINER_ID_LENGTH, &used_ids);
        let container = RetrievalContainer::new(&self.containers_dir, container_id);

        debug!("Creating container {}", container.container_id);

        if let Err(err) = provision(&job.code_dir, &container) {
            // do not leave half-built containers behind
            container.remove_directories()?;
            return Err(err);
        }

        self.containers.push(container.clone());
        Ok(container)
    }

    /// Removes the directories of the container with the given id.
    pub fn remove_container(&mut self, container_id: &str) -> Result<(), ContainerError> {
        let index = self
            .containers
            .iter()
            .position(|c| c.container_id == container_id)
            .ok_or_else(|| ContainerError::UnknownContainer(container_id.to_string()))?;

        let container = self.containers.remove(index);
        container.remove_directories()?;

        debug!("Removed container {}", container_id);
        Ok(())
    }

    /// Removes all known containers. With `include_unknown` every
    /// container directory inside the containers directory is removed,
    /// including leftovers of crashed runs. Other directories are kept.
    pub fn remove_all_containers(&mut self, include_unknown: bool) -> Result<(), ContainerError> {
        if include_unknown {
            for entry in fs::read_dir(&self.containers_dir)? {
                let entry = entry?;
                let is_container = entry
                    .file_name()
                    .to_str()
                    .map_or(false, |name| name.starts_with(CONTAINER_PREFIX));
                if is_container && entry.path().is_dir() {
                    fs::remove_dir_all(entry.path())?;
                }
            }
        } else {
            for container in &self.containers {
                container.remove_directories()?;
            }
        }

        self.containers.clear();
        Ok(())
    }

    pub fn container_ids(&self) -> Vec<&str> {
        self.containers
            .iter()
            .map(|c| c.container_id.as_str())
            .collect()
    }
}

fn provision(code_dir: &Path, container: &RetrievalContainer) -> Result<(), ContainerError> {
    utils::copy_dir_all(&code_dir.join("main"), &container.container_path)?;

    let installer = code_dir.join("install.sh");
    if installer.is_file() {
        debug!("Running installer in container {}", container.container_id);
        let output = Command::new("/bin/sh")
            .arg(&installer)
            .current_dir(&container.container_path)
            .output()?;
        if !output.status.success() {
            return Err(ContainerError::InstallFailed(
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
    }

    for sub in ["ifg", "map", "log"] {
        fs::create_dir_all(container.data_input_path.join(sub))?;
    }
    fs::create_dir_all(&container.data_output_path)?;

    Ok(())
}
