// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use data_encoding::HEXLOWER;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::config::Settings;
use crate::disk_scheduler::DiskScheduler;
use crate::torrent_file::parser::{self, ParseError};
use crate::torrent_file::Torrent;
use crate::torrent_manager::manager::{ManagerError, VerifyReport};
use crate::torrent_manager::{TorrentManager, TorrentParameters};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Hash-checks data already on disk against a `.torrent` file.
    Check {
        torrent: PathBuf,
        /// Folder holding the data; defaults to the configured download folder.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Prints what a `.torrent` file describes.
    Inspect { torrent: PathBuf },
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid torrent file: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

pub fn load_torrent(path: &Path) -> Result<Torrent, CliError> {
    let bytes = std::fs::read(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parser::from_bytes(&bytes)?)
}

pub fn describe(torrent: &Torrent) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "name:         {}", torrent.info.name);
    let _ = writeln!(out, "info hash:    {}", HEXLOWER.encode(&torrent.info_hash()));
    let _ = writeln!(out, "size:         {} bytes", torrent.info.total_length());
    let _ = writeln!(
        out,
        "pieces:       {} x {} bytes",
        torrent.piece_count(),
        torrent.info.piece_length
    );
    for (path, length) in torrent.file_list() {
        let _ = writeln!(out, "file:         {} ({} bytes)", path.join("/"), length);
    }
    for url in torrent.tracker_urls() {
        let _ = writeln!(out, "tracker:      {}", url);
    }
    out
}

/// Builds a manager for `torrent` with its data under `dir` and verifies
/// whatever is already there.
pub async fn check(torrent: Torrent, dir: Option<PathBuf>, mut settings: Settings) -> Result<VerifyReport, CliError> {
    if dir.is_some() {
        settings.download_folder = dir;
    }
    let scheduler = DiskScheduler::new();
    let worker = scheduler.start();
    let (_command_tx, command_rx) = mpsc::channel(1);
    let (event_tx, _event_rx) = mpsc::channel(1024);
    let (shutdown_tx, _) = broadcast::channel(1);

    let mut manager = TorrentManager::new(TorrentParameters {
        info_hash: torrent.info_hash(),
        torrent: Some(torrent),
        settings: Arc::new(settings),
        disk_scheduler: scheduler.clone(),
        command_rx,
        manager_event_tx: event_tx,
        shutdown_tx,
    })
    .await?;
    let report = manager.verify_existing().await;

    scheduler.shutdown();
    let _ = worker.await;
    Ok(report?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent_file::Info;
    use sha1::{Digest, Sha1};

    fn torrent_file(dir: &Path, data: &[u8]) -> PathBuf {
        let info = Info {
            name: "blob.bin".to_string(),
            piece_length: 16,
            pieces: data.chunks(16).flat_map(|c| Sha1::digest(c).to_vec()).collect(),
            length: data.len() as i64,
            ..Default::default()
        };
        let mut bytes = b"d8:announce28:http://tracker.test/announce".to_vec();
        bytes.extend_from_slice(b"4:info");
        bytes.extend_from_slice(&serde_bencode::to_bytes(&info).unwrap());
        bytes.push(b'e');
        let path = dir.join("blob.torrent");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_cli_parses_check() {
        let cli = Cli::parse_from(["seedcore", "check", "a.torrent", "--dir", "/data"]);
        match cli.command {
            Commands::Check { torrent, dir } => {
                assert_eq!(torrent, PathBuf::from("a.torrent"));
                assert_eq!(dir, Some(PathBuf::from("/data")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_describe_lists_files_and_trackers() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = load_torrent(&torrent_file(dir.path(), &[1; 40])).unwrap();
        let text = describe(&torrent);
        assert!(text.contains("blob.bin"));
        assert!(text.contains("3 x 16 bytes"));
        assert!(text.contains("http://tracker.test/announce"));
    }

    #[test]
    fn test_missing_file_is_reported() {
        let result = load_torrent(Path::new("/definitely/not/here.torrent"));
        assert!(matches!(result, Err(CliError::Read { .. })));
    }

    #[tokio::test]
    async fn test_check_reports_verified_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..40).collect();
        let torrent = load_torrent(&torrent_file(dir.path(), &data)).unwrap();
        let content_dir = dir.path().join("content");
        std::fs::create_dir_all(&content_dir).unwrap();
        std::fs::write(content_dir.join("blob.bin"), &data).unwrap();

        let settings = Settings {
            metadata_folder: Some(dir.path().join("meta")),
            ..Default::default()
        };
        let report = check(torrent, Some(content_dir), settings).await.unwrap();
        assert_eq!(report.pieces_total, 3);
        assert_eq!(report.pieces_done, 3);
    }
}
