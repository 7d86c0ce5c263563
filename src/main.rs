// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*};

use seedcore::cli::{self, Cli, Commands};
use seedcore::config;

const DEFAULT_LOG_FILTER: LevelFilter = LevelFilter::INFO;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = config::load_settings();

    let base_data_dir = config::get_app_paths()
        .map(|(_, data_dir)| data_dir)
        .unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let log_dir = base_data_dir.join("logs");
    fs::create_dir_all(&log_dir)?;
    let general_log = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(31)
        .filename_prefix("seedcore")
        .filename_suffix("log")
        .build(&log_dir)?;
    let (non_blocking_general, _guard_general) = tracing_appender::non_blocking(general_log);

    let level = LevelFilter::from_str(&settings.log_level).unwrap_or(DEFAULT_LOG_FILTER);
    let filter = Targets::new().with_default(level);
    let general_layer = fmt::layer()
        .with_writer(non_blocking_general)
        .with_ansi(false)
        .with_filter(filter);
    let _ = tracing_subscriber::registry().with(general_layer).try_init();

    tracing::info!("STARTING SEEDCORE");

    match Cli::parse().command {
        Commands::Inspect { torrent } => {
            let torrent = cli::load_torrent(&torrent)?;
            print!("{}", cli::describe(&torrent));
        }
        Commands::Check { torrent, dir } => {
            let torrent = cli::load_torrent(&torrent)?;
            let report = cli::check(torrent, dir, settings).await?;
            println!("{}/{} pieces verified", report.pieces_done, report.pieces_total);
        }
    }
    Ok(())
}
