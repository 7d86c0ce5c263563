// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use figment::providers::{Env, Format};
use figment::{providers::Toml, Figment};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::torrent_manager::phase::PhaseContext;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    // Disk
    pub download_folder: Option<PathBuf>,
    pub metadata_folder: Option<PathBuf>,

    // Scheduling
    pub block_size: u32,
    pub tick_interval_ms: u64,
    pub initial_request_limit: usize,
    pub latency_window_secs: u64,

    // Logging
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_folder: None,
            metadata_folder: None,
            block_size: 16_384,
            tick_interval_ms: 100,
            initial_request_limit: 5,
            latency_window_secs: 5,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn latency_window(&self) -> Duration {
        Duration::from_secs(self.latency_window_secs.max(1))
    }

    /// Resolves the folders against the application data directory.
    pub fn phase_context(&self) -> PhaseContext {
        let data_dir = get_app_paths()
            .map(|(_, data_dir)| data_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        PhaseContext {
            download_folder: self
                .download_folder
                .clone()
                .unwrap_or_else(|| data_dir.join("downloads")),
            metadata_folder: self
                .metadata_folder
                .clone()
                .unwrap_or_else(|| data_dir.join("torrents")),
            block_size: self.block_size.max(1),
        }
    }
}

/// This is the single source of truth for app directories.
pub fn get_app_paths() -> Option<(PathBuf, PathBuf)> {
    if let Some(proj_dirs) = ProjectDirs::from("org", "seedcore", "seedcore") {
        let config_dir = proj_dirs.config_dir().to_path_buf();
        let data_dir = proj_dirs.data_local_dir().to_path_buf();

        // Ensure directories exist
        fs::create_dir_all(&config_dir).ok()?;
        fs::create_dir_all(&data_dir).ok()?;

        Some((config_dir, data_dir))
    } else {
        None
    }
}

fn figment_for(config_file: Option<PathBuf>) -> Figment {
    let mut figment = Figment::new();
    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("SEEDCORE_"))
}

pub fn load_settings() -> Settings {
    let config_file = get_app_paths().map(|(config_dir, _)| config_dir.join("settings.toml"));
    figment_for(config_file).extract().unwrap_or_default()
}

/// Saves the provided settings to the config file.
pub fn save_settings(settings: &Settings) -> io::Result<()> {
    if let Some((config_dir, _)) = get_app_paths() {
        let config_file_path = config_dir.join("settings.toml");
        let temp_file_path = config_dir.join("settings.toml.tmp");
        let content = toml::to_string_pretty(settings).map_err(io::Error::other)?;
        fs::write(&temp_file_path, content)?;
        fs::rename(&temp_file_path, &config_file_path)?;
    }
    Ok(())
}
