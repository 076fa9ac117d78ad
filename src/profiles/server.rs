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

//! Transport to the atmospheric profiles service.

use super::queries::DownloadQuery;
use crate::{configuration::AtmosphericProfileModel, errors::ProfilesError, utils};
use log::debug;
use regex::Regex;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// A service producing atmospheric profiles on request.
pub trait ProfilesServer {
    /// Submits one request for the profiles of a location and date range.
    fn request(&self, model: AtmosphericProfileModel, query: &DownloadQuery) -> Result<(), ProfilesError>;

    /// Moves all finished profile files of the model into `dst_dir`,
    /// returns the number of moved files.
    fn collect(&self, model: AtmosphericProfileModel, dst_dir: &Path) -> Result<usize, ProfilesError>;

    /// Asks the service to report the state of the pending requests.
    fn request_status(&self) -> Result<(), ProfilesError>;
}

/// Profiles service reached through a shared exchange directory.
///
/// Requests are written to `upload/`, finished profiles
/// appear in `download/<model>/`.
#[derive(Clone, Debug)]
pub struct DirectoryServer {
    email: String,
    exchange_dir: PathBuf,
}

impl DirectoryServer {
    pub fn new(email: &str, exchange_dir: &Path) -> Self {
        DirectoryServer {
            email: email.to_string(),
            exchange_dir: exchange_dir.to_path_buf(),
        }
    }

    fn upload_dir(&self) -> Result<PathBuf, ProfilesError> {
        let dir = self.exchange_dir.join("upload");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

impl ProfilesServer for DirectoryServer {
    fn request(&self, model: AtmosphericProfileModel, query: &DownloadQuery) -> Result<(), ProfilesError> {
        let from_date = utils::date_string(query.from_date);
        let to_date = utils::date_string(query.to_date);
        let filename = format!(
            "{}_{}_{}_{}.txt",
            model,
            from_date,
            to_date,
            utils::coordinates_slug(query.lat, query.lon)
        );

        let path = self.upload_dir()?.join(&filename);
        if path.exists() {
            return Err(ProfilesError::Server(format!("request {} is already waiting", filename)));
        }

        fs::write(
            &path,
            format!("{} {} {} {} {}\n", self.email, from_date, to_date, query.lat, query.lon),
        )?;
        debug!("Uploaded request {}", filename);

        Ok(())
    }

    fn collect(&self, model: AtmosphericProfileModel, dst_dir: &Path) -> Result<usize, ProfilesError> {
        let src_dir = self.exchange_dir.join("download").join(model.as_str());
        if !src_dir.is_dir() {
            return Ok(0);
        }

        let pattern = Regex::new(r"^\d{8,10}_\d{2}(N|S)\d{3}(E|W)\.(map|mod|vmr)$")
            .map_err(|err| ProfilesError::Server(err.to_string()))?;

        fs::create_dir_all(dst_dir)?;
        let mut count = 0;

        for entry in fs::read_dir(&src_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !pattern.is_match(&name) {
                continue;
            }

            let dst = dst_dir.join(&name);
            if fs::rename(entry.path(), &dst).is_err() {
                // exchange directory may live on another filesystem
                fs::copy(entry.path(), &dst)?;
                fs::remove_file(entry.path())?;
            }
            count += 1;
        }

        Ok(count)
    }

    fn request_status(&self) -> Result<(), ProfilesError> {
        fs::write(self.upload_dir()?.join("ginput_status.txt"), &self.email)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn request_and_collect() {
        let dir = tempfile::tempdir().unwrap();
        let server = DirectoryServer::new("someone@example.com", dir.path());
        let query = DownloadQuery {
            lat: 48,
            lon: -11,
            from_date: NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
            to_date: NaiveDate::from_ymd_opt(2022, 1, 7).unwrap(),
        };

        server.request(AtmosphericProfileModel::GGG2014, &query).unwrap();
        let request = dir.path().join("upload/GGG2014_20220101_20220107_48N011W.txt");
        assert_eq!(
            fs::read_to_string(&request).unwrap(),
            "someone@example.com 20220101 20220107 48 -11\n"
        );
        assert!(matches!(
            server.request(AtmosphericProfileModel::GGG2014, &query),
            Err(ProfilesError::Server(_))
        ));

        let download = dir.path().join("download/GGG2014");
        fs::create_dir_all(&download).unwrap();
        fs::write(download.join("20220101_48N011W.map"), "map").unwrap();
        fs::write(download.join("20220101_48N011W.mod"), "mod").unwrap();
        fs::write(download.join("README"), "ignored").unwrap();

        let dst = dir.path().join("profiles/GGG2014");
        assert_eq!(server.collect(AtmosphericProfileModel::GGG2014, &dst).unwrap(), 2);
        assert!(dst.join("20220101_48N011W.map").is_file());
        assert!(download.join("README").exists());
        assert_eq!(server.collect(AtmosphericProfileModel::GGG2020, &dst).unwrap(), 0);
    }
}
