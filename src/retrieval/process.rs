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

//! Runs the retrieval program inside a prepared container.

use super::{
    lock,
    session::{RetrievalSession, SessionLog},
};
use crate::{configuration::RetrievalConfig, errors::SessionError, utils};
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use std::{
    fs,
    os::unix::process::CommandExt,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

fn replacements(session: &RetrievalSession) -> Vec<(&'static str, String)> {
    let ctx = &session.context;
    let container = &session.container;
    vec![
        ("SENSOR_ID", ctx.sensor_id.clone()),
        ("SERIAL_NUMBER", ctx.serial_number.to_string()),
        ("DATE", utils::date_string(session.date())),
        ("DATE_SHORT", utils::short_date_string(session.date())),
        ("LAT", ctx.location.lat.to_string()),
        ("LON", ctx.location.lon.to_string()),
        ("ALT", ctx.location.alt.to_string()),
        ("UTC_OFFSET", ctx.utc_offset.to_string()),
        ("CONTAINER_DIR", container.container_path.display().to_string()),
        ("INPUT_DIR", container.data_input_path.display().to_string()),
        ("OUTPUT_DIR", container.data_output_path.display().to_string()),
        ("CONFIG_PATH", container.container_path.join("config.yml").display().to_string()),
        (
            "ATMOSPHERIC_PROFILE_MODEL",
            session.job.atmospheric_profile_model.as_str().to_string(),
        ),
    ]
}

/// Renders `config.template.yml` of the container into `config.yml`.
pub fn render_config(session: &RetrievalSession, log: &mut SessionLog) -> Result<(), SessionError> {
    let template_path = session.container.container_path.join("config.template.yml");
    if !template_path.is_file() {
        log.debug("Container has no config template");
        return Ok(());
    }

    let template = fs::read_to_string(&template_path)?;
    let rendered = utils::insert_replacements(&template, &replacements(session));
    fs::write(session.container.container_path.join("config.yml"), rendered)?;

    Ok(())
}

/// Runs the configured command in the container and waits for it.
///
/// Returns `Ok(true)` when the process exited with status 0. The process
/// runs in its own process group; the whole group is killed when it runs
/// longer than `timeout_seconds` or when a stop of the scheduler is requested.
pub fn run(
    session: &RetrievalSession,
    config: &RetrievalConfig,
    log: &mut SessionLog,
) -> Result<bool, SessionError> {
    render_config(session, log)?;

    let replacements = replacements(session);
    let command: Vec<String> = session
        .job
        .command
        .iter()
        .map(|arg| utils::insert_replacements(arg, &replacements))
        .collect();
    let (program, args) = command
        .split_first()
        .ok_or_else(|| SessionError::InvalidInput("empty retrieval command".to_string()))?;

    let logfiles_dir = session.container.data_output_path.join("logfiles");
    fs::create_dir_all(&logfiles_dir)?;
    let stdout = fs::File::create(logfiles_dir.join("container.log"))?;
    let stderr = stdout.try_clone()?;

    log.info(&format!("Running {}", command.join(" ")));
    let start = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .current_dir(&session.container.container_path)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0)
        .spawn()?;

    let timeout = Duration::from_secs(config.timeout_seconds);
    let poll_interval = Duration::from_millis(config.poll_interval_ms);

    loop {
        if let Some(status) = child.try_wait()? {
            log.info(&format!(
                "Retrieval process finished after {:.1} s with {}",
                start.elapsed().as_secs_f64(),
                status
            ));
            return Ok(status.success());
        }

        if start.elapsed() > timeout {
            log.warn("Retrieval process timed out, killing it");
            kill_process_group(&mut child, log)?;
            return Err(SessionError::Timeout(config.timeout_seconds));
        }

        if lock::stop_requested(&config.containers_dir) {
            log.warn("Stop of the retrieval was requested, killing the process");
            kill_process_group(&mut child, log)?;
            return Err(SessionError::Cancelled);
        }

        thread::sleep(poll_interval);
    }
}

/// Kills the child together with everything it spawned.
fn kill_process_group(child: &mut Child, log: &mut SessionLog) -> Result<(), SessionError> {
    let group = Pid::from_raw(child.id() as i32);
    if let Err(err) = killpg(group, Signal::SIGKILL) {
        log.warn(&format!("Cannot kill process group {}: {}", group, err));
        child.kill()?;
    }
    child.wait()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::test_support::{date, fixture};

    #[test]
    fn mock_retrieval_writes_outputs() {
        let f = fixture();
        let session = f.session("ma", date(6, 2));
        let mut log = SessionLog::new(&session);

        assert!(run(&session, &f.config, &mut log).unwrap());

        let output = &session.container.data_output_path;
        assert!(output.join("results/comb_invparms_ma_SN061_220602-220602.csv").is_file());
        let container_log = fs::read_to_string(output.join("logfiles/container.log")).unwrap();
        assert!(container_log.contains("mock retrieval for ma on 220602 done"));
    }

    #[test]
    fn config_template_is_rendered() {
        let f = fixture();
        let session = f.session("ma", date(6, 2));
        let mut log = SessionLog::new(&session);
        fs::write(
            session.container.container_path.join("config.template.yml"),
            "site: %SENSOR_ID%\ndate: %DATE%\nlat: %LAT%\nmodel: %ATMOSPHERIC_PROFILE_MODEL%\n",
        )
        .unwrap();

        render_config(&session, &mut log).unwrap();
        let rendered = fs::read_to_string(session.container.container_path.join("config.yml")).unwrap();
        assert_eq!(rendered, "site: ma\ndate: 20220602\nlat: 48.1\nmodel: GGG2014\n");
    }

    #[test]
    fn failing_and_hanging_processes() {
        let mut f = fixture();
        let session = f.session("fail", date(6, 2));
        let mut log = SessionLog::new(&session);
        assert!(!run(&session, &f.config, &mut log).unwrap());

        f.config.timeout_seconds = 0;
        f.config.jobs[0].command = vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 5".to_string()];
        let session = f.session("ma", date(6, 2));
        let mut log = SessionLog::new(&session);
        assert!(matches!(
            run(&session, &f.config, &mut log),
            Err(SessionError::Timeout(0))
        ));
    }

    #[test]
    fn timeout_kills_spawned_processes() {
        let mut f = fixture();
        f.config.timeout_seconds = 1;
        f.config.jobs[0].command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "(sleep 2; touch marker); true".to_string(),
        ];
        let session = f.session("ma", date(6, 2));
        let mut log = SessionLog::new(&session);

        assert!(matches!(
            run(&session, &f.config, &mut log),
            Err(SessionError::Timeout(1))
        ));

        // the subshell would have written the marker by now
        thread::sleep(Duration::from_secs(3));
        assert!(!session.container.container_path.join("marker").exists());
    }

    #[test]
    fn stop_request_cancels_process() {
        let mut f = fixture();
        f.config.jobs[0].command = vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()];
        let session = f.session("ma", date(6, 2));
        let mut log = SessionLog::new(&session);

        lock::request_stop(&f.config.containers_dir).unwrap();
        let start = Instant::now();
        assert!(matches!(
            run(&session, &f.config, &mut log),
            Err(SessionError::Cancelled)
        ));
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
