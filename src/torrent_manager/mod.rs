// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod choking;
pub mod disk_job;
pub mod file_set;
pub mod manager;
pub mod peer;
pub mod phase;
pub mod piece;
pub mod piece_selector;
pub mod request_limiter;
pub mod state;

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::Mutex;

use crate::command::TorrentCommand;
use crate::config::Settings;
use crate::disk_scheduler::DiskScheduler;
use crate::torrent_file::{Torrent, HASH_LENGTH};
use crate::torrent_manager::phase::PhaseId;
use crate::torrent_manager::state::TorrentState;

pub type InfoHash = [u8; HASH_LENGTH];

/// Shared per-torrent state. All mutation of pieces and peers goes through
/// `state`, which serializes the scheduling loop, network input and disk jobs.
#[derive(Debug)]
pub struct TorrentContext {
    pub info_hash: InfoHash,
    pub state: Mutex<TorrentState>,
    pub event_tx: Sender<ManagerEvent>,
}

impl TorrentContext {
    pub fn new(info_hash: InfoHash, state: TorrentState, event_tx: Sender<ManagerEvent>) -> Arc<Self> {
        Arc::new(Self {
            info_hash,
            state: Mutex::new(state),
            event_tx,
        })
    }

    pub fn notify(&self, event: ManagerEvent) {
        let _ = self.event_tx.try_send(event);
    }
}

pub struct TorrentParameters {
    pub info_hash: InfoHash,
    // Parsed `.torrent` file, when the torrent was not added from a magnet link
    pub torrent: Option<Torrent>,
    pub settings: Arc<Settings>,
    pub disk_scheduler: DiskScheduler,
    pub command_rx: Receiver<TorrentCommand>,
    pub manager_event_tx: Sender<ManagerEvent>,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Notifications for the surrounding application and tracker manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    PhaseChanged {
        info_hash: InfoHash,
        from: PhaseId,
        to: PhaseId,
    },
    MetadataLoaded {
        info_hash: InfoHash,
    },
    PieceVerified {
        info_hash: InfoHash,
        piece_index: u32,
    },
    DownloadComplete {
        info_hash: InfoHash,
    },
    AnnounceCompleted {
        info_hash: InfoHash,
        tracker_urls: Vec<String>,
    },
}

pub use manager::TorrentManager;
