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

//! Small helpers shared by the pipeline modules.

use chrono::{Duration, NaiveDate};
use rand::{distributions::Uniform, Rng};
use std::{
    fs,
    io::{self, BufRead, BufReader},
    os::unix::fs::PermissionsExt,
    path::Path,
    process::Command,
};
use walkdir::WalkDir;

/// Inclusive range of dates, ascending.
pub fn date_range(from_date: NaiveDate, to_date: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = vec![];
    let mut current = from_date;

    while current <= to_date {
        dates.push(current);
        current += Duration::days(1);
    }

    dates
}

/// `20220602`
pub fn date_string(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// `220602`
pub fn short_date_string(date: NaiveDate) -> String {
    date.format("%y%m%d").to_string()
}

/// Coordinates as they appear in profile file names, e.g. `48N011E`.
pub fn coordinates_slug(lat: i32, lon: i32) -> String {
    format!(
        "{:02}{}{:03}{}",
        lat.abs(),
        if lat < 0 { 'S' } else { 'N' },
        lon.abs(),
        if lon < 0 { 'W' } else { 'E' }
    )
}

/// Replaces every `%KEY%` in `content` with its value.
pub fn insert_replacements(content: &str, replacements: &[(&str, String)]) -> String {
    let mut result = content.to_string();
    for (key, value) in replacements {
        result = result.replace(&format!("%{}%", key), value);
    }
    result
}

/// Parses a mask like `rw-r--r--` into a unix mode.
pub fn parse_permission_mask(mask: &str) -> Option<u32> {
    if mask.len() != 9 {
        return None;
    }

    let mut mode = 0;
    for (i, c) in mask.chars().enumerate() {
        let expected = ['r', 'w', 'x'][i % 3];
        mode <<= 1;
        if c == expected {
            mode |= 1;
        } else if c != '-' {
            return None;
        }
    }

    Some(mode)
}

pub fn set_permissions(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Copies a whole directory tree, creating `dst` on the way.
pub fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

/// Lowercase random string which is not contained in `forbidden`.
pub fn random_string(length: usize, forbidden: &[String]) -> String {
    let mut rng = rand::thread_rng();
    let letters = Uniform::new_inclusive(b'a', b'z');

    loop {
        let candidate: String = (0..length)
            .map(|_| char::from(rng.sample(letters)))
            .collect();
        if !forbidden.contains(&candidate) {
            return candidate;
        }
    }
}

pub fn count_lines(path: &Path) -> io::Result<usize> {
    let file = fs::File::open(path)?;
    Ok(BufReader::new(file).lines().count())
}

/// Short commit hash of the pipeline checkout, if it is one.
pub fn commit_sha() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "--verify", "HEAD"])
        .current_dir(env!("CARGO_MANIFEST_DIR"))
        .output()
        .ok()?;

    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinates() {
        assert_eq!(coordinates_slug(48, 11), "48N011E");
        assert_eq!(coordinates_slug(-5, -70), "05S070W");
        assert_eq!(coordinates_slug(0, 0), "00N000E");
    }

    #[test]
    fn permission_masks() {
        assert_eq!(parse_permission_mask("rwxr-xr-x"), Some(0o755));
        assert_eq!(parse_permission_mask("r--r--r--"), Some(0o444));
        assert_eq!(parse_permission_mask("rw-rw----"), Some(0o660));
        assert_eq!(parse_permission_mask("rwxrwxrw"), None);
        assert_eq!(parse_permission_mask("xwrr--r--"), None);
    }

    #[test]
    fn dates() {
        let from = NaiveDate::from_ymd_opt(2020, 2, 27).unwrap();
        let to = NaiveDate::from_ymd_opt(2020, 3, 1).unwrap();

        assert_eq!(date_range(from, to).len(), 4);
        assert!(date_range(to, from).is_empty());
        assert_eq!(date_string(from), "20200227");
        assert_eq!(short_date_string(from), "200227");
    }

    #[test]
    fn replacements() {
        let rendered = insert_replacements(
            "sensor: %SENSOR_ID%\ndate: %DATE%\nkeep: %UNKNOWN%",
            &[("SENSOR_ID", "ma".to_string()), ("DATE", "20220602".to_string())],
        );
        assert_eq!(rendered, "sensor: ma\ndate: 20220602\nkeep: %UNKNOWN%");
    }

    #[test]
    fn random_strings_avoid_forbidden() {
        let forbidden = vec!["a".to_string()];
        for _ in 0..10 {
            let s = random_string(1, &forbidden);
            assert_ne!(s, "a");
            assert!(s.chars().all(|c| c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn copy_tree() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("a/b")).unwrap();
        fs::write(src.path().join("a/b/c.txt"), "content").unwrap();
        fs::write(src.path().join("top.txt"), "top").unwrap();

        let dst = tempfile::tempdir().unwrap();
        let target = dst.path().join("copy");
        copy_dir_all(src.path(), &target).unwrap();

        assert_eq!(fs::read_to_string(target.join("a/b/c.txt")).unwrap(), "content");
        assert_eq!(fs::read_to_string(target.join("top.txt")).unwrap(), "top");
    }
}
