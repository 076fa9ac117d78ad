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

//! EM27 Retrieval Pipeline automates the processing of interferograms
//! recorded by EM27/SUN spectrometers into column averaged greenhouse
//! gas concentrations.
//!
//! The pipeline schedules one retrieval per sensor and day, runs every
//! retrieval in its own container directory, requests the atmospheric
//! profiles the retrievals need and merges the results of measurement
//! campaigns into daily export files.

mod configuration;
mod constants;
mod errors;
mod export;
mod metadata;
mod profiles;
mod report;
mod retrieval;
mod utils;


use clap::{Parser, Subcommand};
use configuration::Config;
use env_logger::Env;
use errors::PipelineError;
use log::{error, info};
use std::{path::PathBuf, process};

#[derive(Parser)]
#[command(name = "em27-pipeline")]
#[command(about = "Automated retrieval pipeline for EM27/SUN measurements", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Automated retrievals
    Retrieval {
        #[command(subcommand)]
        command: RetrievalCommands,
    },

    /// Atmospheric profiles
    Profiles {
        #[command(subcommand)]
        command: ProfilesCommands,
    },

    /// Campaign exports
    Export {
        #[command(subcommand)]
        command: ExportCommands,
    },

    /// Write a report of the data present on disk
    DataReport {
        /// Output csv file
        #[arg(short, long, default_value = "data-report.csv")]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum RetrievalCommands {
    /// Run the scheduler in the foreground until all queues are empty
    Run,

    /// Start the scheduler as a background process
    Start,

    /// Print the pid of the running scheduler
    IsRunning,

    /// Cancel the running sessions and wait for the scheduler to exit
    Stop,

    /// Show the upcoming queue items without processing them
    Queue {
        /// Number of items to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show the status of the current or last run
    Status,
}

#[derive(Subcommand)]
enum ProfilesCommands {
    /// Collect finished profiles and submit missing requests
    Run,

    /// Ask the profile service for the state of the pending requests
    RequestStatus,
}

#[derive(Subcommand)]
enum ExportCommands {
    /// Export all configured targets
    Run,
}

/// The main program function.
///
/// `env_logger` is initialised before anything else so that
/// every error during setup is reported.
fn main() {
    #[cfg(not(feature = "debug"))]
    let logger_env = Env::new().filter_or("EM27_LOG_LEVEL", "info");

    #[cfg(feature = "debug")]
    let logger_env = Env::new().filter_or("EM27_LOG_LEVEL", "debug");

    env_logger::Builder::from_env(logger_env)
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(_) => info!("Pipeline execution finished"),
        Err(err) => {
            error!("Pipeline execution failed with error: {}", err);
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<(), PipelineError> {
    let config = Config::new_from_file(&cli.config)?;

    match cli.command {
        Commands::Retrieval { command } => match command {
            RetrievalCommands::Run => retrieval::main(&config),
            RetrievalCommands::Start => {
                let pid = retrieval::start(config.retrieval()?, &cli.config)?;
                println!("started the retrieval scheduler with pid {}", pid);
                Ok(())
            }
            RetrievalCommands::IsRunning => {
                match retrieval::is_running(config.retrieval()?) {
                    Some(pid) => println!("retrieval scheduler is running with pid {}", pid),
                    None => println!("retrieval scheduler is not running"),
                }
                Ok(())
            }
            RetrievalCommands::Stop => retrieval::stop(config.retrieval()?),
            RetrievalCommands::Queue { limit } => {
                for (i, (job, ctx)) in retrieval::preview_queue(&config, limit)?.iter().enumerate() {
                    println!(
                        "{:>3}. {} {} {} at {}",
                        i + 1,
                        job,
                        ctx.sensor_id,
                        ctx.date(),
                        ctx.location.location_id
                    );
                }
                Ok(())
            }
            RetrievalCommands::Status => {
                for item in retrieval::read_status(&config)? {
                    println!(
                        "{}/{} {} {} [{}] {}{}",
                        item.retrieval_algorithm,
                        item.atmospheric_profile_model,
                        item.sensor_id,
                        item.date,
                        item.container_id,
                        item.state,
                        item.error.map(|e| format!(" ({})", e)).unwrap_or_default()
                    );
                }
                Ok(())
            }
        },
        Commands::Profiles { command } => match command {
            ProfilesCommands::Run => profiles::main(&config),
            ProfilesCommands::RequestStatus => profiles::request_status(&config),
        },
        Commands::Export { command } => match command {
            ExportCommands::Run => export::main(&config),
        },
        Commands::DataReport { output } => report::main(&config, &output),
    }
}
