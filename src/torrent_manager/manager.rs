// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::mpsc::Receiver;
use tracing::{event, Level};

use crate::command::{TorrentCommand, TorrentCommandSummary};
use crate::disk_scheduler::DiskScheduler;
use crate::errors::{ConfigurationError, PhaseError};
use crate::storage::create_and_allocate_files;
use crate::torrent_manager::disk_job::DiskJob;
use crate::torrent_manager::file_set::FileSetKind;
use crate::torrent_manager::phase::{relevant_peers_for, Phase, PhaseChain, PhaseId};
use crate::torrent_manager::piece::BlockStatus;
use crate::torrent_manager::request_limiter::RequestLimiter;
use crate::torrent_manager::state::{Effect, TorrentState};
use crate::torrent_manager::{ManagerEvent, TorrentContext, TorrentParameters};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Phase(#[from] PhaseError),
}

/// Outcome of checking data already present in the download folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub pieces_total: usize,
    pub pieces_done: usize,
}

/// Drives one torrent: applies inbound commands, runs the periodic
/// scheduling pass, advances phases and carries out the resulting effects.
pub struct TorrentManager {
    context: Arc<TorrentContext>,
    chain: PhaseChain,
    phase: Box<dyn Phase>,
    disk_scheduler: DiskScheduler,
    command_rx: Receiver<TorrentCommand>,
    shutdown_rx: broadcast::Receiver<()>,
    tick_interval: Duration,
}

impl TorrentManager {
    pub async fn new(params: TorrentParameters) -> Result<Self, ManagerError> {
        let chain = PhaseChain::standard(params.settings.phase_context())?;
        Self::with_chain(params, chain).await
    }

    pub async fn with_chain(params: TorrentParameters, chain: PhaseChain) -> Result<Self, ManagerError> {
        let TorrentParameters {
            info_hash,
            torrent,
            settings,
            disk_scheduler,
            command_rx,
            manager_event_tx,
            shutdown_tx,
        } = params;

        let mut state = TorrentState::new(info_hash, settings.initial_request_limit);
        state.limiter = RequestLimiter::new(settings.latency_window());
        if let Some(torrent) = torrent {
            state = state.with_torrent(torrent);
        }

        let context = TorrentContext::new(info_hash, state, manager_event_tx);
        let mut phase = chain.create_initial_phase()?;
        let mut effects = Vec::new();
        {
            let mut state = context.state.lock().await;
            phase.on_enter(&mut state, &mut effects)?;
        }
        event!(Level::INFO, phase = %phase.id(), "Torrent manager created.");

        let mut manager = Self {
            context,
            chain,
            phase,
            disk_scheduler,
            command_rx,
            shutdown_rx: shutdown_tx.subscribe(),
            tick_interval: settings.tick_interval(),
        };
        manager.apply_effects(effects).await;
        manager.advance_phases().await?;
        Ok(manager)
    }

    pub fn context(&self) -> Arc<TorrentContext> {
        Arc::clone(&self.context)
    }

    pub fn phase_id(&self) -> PhaseId {
        self.phase.id()
    }

    pub async fn run(mut self) -> Result<(), ManagerError> {
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    event!(Level::INFO, "Shutdown received, stopping torrent manager.");
                    break Ok(());
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            event!(Level::DEBUG, "Command channel closed, stopping torrent manager.");
                            break Ok(());
                        }
                    }
                }
                _ = tick.tick() => {
                    self.tick().await?;
                }
            }
        }
    }

    pub async fn handle_command(&mut self, command: TorrentCommand) {
        event!(Level::TRACE, command = ?TorrentCommandSummary(&command), "Handling command.");
        let result = {
            let mut state = self.context.state.lock().await;
            state.handle_command(command, Instant::now())
        };
        match result {
            Ok(effects) => self.apply_effects(effects).await,
            Err(e) => event!(Level::WARN, error = %e, "Rejected peer input."),
        }
    }

    /// One scheduling pass: phase transition check, then strategies and
    /// requests for the phase's relevant peers.
    pub async fn tick(&mut self) -> Result<(), ManagerError> {
        self.advance_phases().await?;
        let effects = {
            let mut state = self.context.state.lock().await;
            let relevant = relevant_peers_for(self.phase.as_ref(), &state);
            state.tick(&relevant, Instant::now())
        };
        self.apply_effects(effects).await;
        Ok(())
    }

    /// Moves through every phase that is already complete.
    pub async fn advance_phases(&mut self) -> Result<(), ManagerError> {
        loop {
            let mut effects = Vec::new();
            let next = {
                let mut state = self.context.state.lock().await;
                self.chain
                    .advance_if_done(self.phase.as_mut(), &mut state, &mut effects)?
            };
            self.apply_effects(effects).await;
            match next {
                Some(next) => self.phase = next,
                None => return Ok(()),
            }
        }
    }

    /// Treats every unverified data piece as stored and hash-checks it.
    /// Pieces that fail are returned to Needed in full.
    pub async fn verify_existing(&mut self) -> Result<VerifyReport, ManagerError> {
        let pieces = {
            let mut state = self.context.state.lock().await;
            let Some(file_set) = state.file_set.as_mut().filter(|fs| fs.kind() == FileSetKind::Data) else {
                return Err(PhaseError::MissingMetadata.into());
            };
            let mut pieces = Vec::new();
            for index in 0..file_set.piece_count() as u32 {
                if let Some(piece) = file_set.piece_mut(index).filter(|p| !p.is_done()) {
                    for block in 0..piece.block_count() as u32 {
                        let _ = piece.set_block_status(block, BlockStatus::Stored);
                    }
                    pieces.push(index);
                }
            }
            state.pending_checks += pieces.len();
            pieces
        };

        event!(Level::INFO, pieces = pieces.len(), "Verifying existing data.");
        for piece_index in pieces {
            self.disk_scheduler.submit(DiskJob::CheckHash {
                torrent: Arc::clone(&self.context),
                kind: FileSetKind::Data,
                piece_index,
            });
        }
        self.disk_scheduler.wait_idle().await;

        let report = {
            let mut state = self.context.state.lock().await;
            let Some(file_set) = state.file_set.as_mut() else {
                return Err(PhaseError::MissingMetadata.into());
            };
            for index in 0..file_set.piece_count() as u32 {
                if let Some(piece) = file_set.piece_mut(index).filter(|p| !p.is_done()) {
                    for block in 0..piece.block_count() as u32 {
                        let _ = piece.set_block_status(block, BlockStatus::Needed);
                    }
                }
            }
            VerifyReport {
                pieces_total: file_set.piece_count(),
                pieces_done: file_set.pieces_done(),
            }
        };
        event!(
            Level::INFO,
            done = report.pieces_done,
            total = report.pieces_total,
            "Existing data verified."
        );
        self.advance_phases().await?;
        Ok(report)
    }

    async fn apply_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::SendToPeer { peer_id, message } => {
                    let state = self.context.state.lock().await;
                    let sent = state.peers.get(&peer_id).is_some_and(|peer| peer.send(message));
                    if !sent {
                        event!(Level::TRACE, peer = %peer_id, "Peer channel unavailable, message dropped.");
                    }
                }
                Effect::StoreBlock {
                    kind,
                    piece_index,
                    block_index,
                    data,
                } => self.disk_scheduler.submit(DiskJob::StoreBlock {
                    torrent: Arc::clone(&self.context),
                    kind,
                    piece_index,
                    block_index,
                    data,
                }),
                Effect::SendBlock {
                    peer_id,
                    piece_index,
                    offset,
                    length,
                } => {
                    let peer_tx = {
                        let state = self.context.state.lock().await;
                        state.peers.get(&peer_id).map(|peer| peer.peer_tx.clone())
                    };
                    if let Some(peer_tx) = peer_tx {
                        self.disk_scheduler.submit(DiskJob::SendBlock {
                            torrent: Arc::clone(&self.context),
                            peer_id,
                            peer_tx,
                            piece_index,
                            offset,
                            length,
                        });
                    }
                }
                Effect::AllocateFiles(layout) => {
                    if let Err(e) = create_and_allocate_files(&layout).await {
                        event!(Level::ERROR, error = %e, "Failed to allocate torrent files.");
                    }
                }
                Effect::PersistMetadata { path, torrent_bytes } => {
                    tokio::spawn(async move {
                        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                            return;
                        }
                        if let Some(parent) = path.parent() {
                            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                                event!(Level::WARN, error = %e, "Failed to create metadata folder.");
                                return;
                            }
                        }
                        match tokio::fs::write(&path, torrent_bytes).await {
                            Ok(()) => event!(Level::INFO, path = %path.display(), "Saved torrent metadata."),
                            Err(e) => event!(Level::WARN, path = %path.display(), error = %e, "Failed to save torrent metadata."),
                        }
                    });
                }
                Effect::Notify(manager_event) => self.notify(manager_event),
            }
        }
    }

    fn notify(&self, manager_event: ManagerEvent) {
        if self.context.event_tx.try_send(manager_event).is_err() {
            event!(Level::DEBUG, "Manager event channel full or closed.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::PeerMessage;
    use crate::config::Settings;
    use crate::torrent_file::{parser, Info, Torrent};
    use sha1::{Digest, Sha1};
    use tokio::sync::mpsc::{self, Sender};

    struct Harness {
        manager: TorrentManager,
        command_tx: Sender<TorrentCommand>,
        events: Receiver<ManagerEvent>,
        scheduler: DiskScheduler,
        _dir: tempfile::TempDir,
    }

    fn content() -> Vec<u8> {
        (0..50u8).collect()
    }

    fn torrent_for(data: &[u8], piece_length: usize) -> Torrent {
        let pieces = data
            .chunks(piece_length)
            .flat_map(|chunk| Sha1::digest(chunk).to_vec())
            .collect();
        let info = Info {
            name: "payload.bin".to_string(),
            piece_length: piece_length as i64,
            pieces,
            length: data.len() as i64,
            ..Default::default()
        };
        let info_bytes = serde_bencode::to_bytes(&info).unwrap();
        parser::from_bytes(&parser::wrap_info_bytes(&info_bytes)).unwrap()
    }

    async fn harness(torrent: Option<Torrent>, info_hash: [u8; 20]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            download_folder: Some(dir.path().join("downloads")),
            metadata_folder: Some(dir.path().join("torrents")),
            block_size: 5,
            ..Default::default()
        };
        let scheduler = DiskScheduler::new();
        scheduler.start();
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, events) = mpsc::channel(64);
        let (shutdown_tx, _) = broadcast::channel(1);

        let manager = TorrentManager::new(TorrentParameters {
            info_hash,
            torrent,
            settings: Arc::new(settings),
            disk_scheduler: scheduler.clone(),
            command_rx,
            manager_event_tx: event_tx,
            shutdown_tx,
        })
        .await
        .unwrap();

        Harness {
            manager,
            command_tx,
            events,
            scheduler,
            _dir: dir,
        }
    }

    fn drain_events(events: &mut Receiver<ManagerEvent>) -> Vec<ManagerEvent> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_torrent_file_starts_in_data_phase() {
        let torrent = torrent_for(&content(), 50);
        let info_hash = torrent.info_hash();
        let mut h = harness(Some(torrent), info_hash).await;
        assert_eq!(h.manager.phase_id(), PhaseId::Data);

        let events = drain_events(&mut h.events);
        assert!(events.contains(&ManagerEvent::MetadataLoaded { info_hash }));
        drop(h.command_tx);
    }

    #[tokio::test]
    async fn test_download_single_piece_to_seed() {
        let data = content();
        let torrent = torrent_for(&data, 50);
        let info_hash = torrent.info_hash();
        let mut h = harness(Some(torrent), info_hash).await;

        let (peer_tx, mut peer_rx) = mpsc::channel(64);
        h.manager
            .handle_command(TorrentCommand::PeerConnected {
                peer_id: "10.0.0.2:6881".into(),
                peer_tx,
                metadata_size: None,
            })
            .await;
        h.manager
            .handle_command(TorrentCommand::Have("10.0.0.2:6881".into(), 0))
            .await;
        h.manager
            .handle_command(TorrentCommand::Unchoke("10.0.0.2:6881".into()))
            .await;

        // Serve every request until the piece is complete.
        for _ in 0..20 {
            h.manager.tick().await.unwrap();
            while let Ok(message) = peer_rx.try_recv() {
                if let PeerMessage::Request { index, begin, length } = message {
                    let start = begin as usize;
                    let block = data[start..start + length as usize].to_vec();
                    h.manager
                        .handle_command(TorrentCommand::Block("10.0.0.2:6881".into(), index, begin, block))
                        .await;
                }
            }
            h.scheduler.wait_idle().await;
            if h.manager.phase_id() == PhaseId::Seed {
                break;
            }
        }
        h.manager.tick().await.unwrap();
        assert_eq!(h.manager.phase_id(), PhaseId::Seed);

        let path = h._dir.path().join("downloads").join("payload.bin");
        assert_eq!(tokio::fs::read(path).await.unwrap(), data);

        let events = drain_events(&mut h.events);
        assert!(events.contains(&ManagerEvent::PieceVerified {
            info_hash,
            piece_index: 0
        }));
        assert!(events.contains(&ManagerEvent::DownloadComplete { info_hash }));
        assert!(events.contains(&ManagerEvent::PhaseChanged {
            info_hash,
            from: PhaseId::Data,
            to: PhaseId::Seed
        }));
    }

    #[tokio::test]
    async fn test_magnet_fetches_metadata_from_peer() {
        let data = content();
        let torrent = torrent_for(&data, 25);
        let info_hash = torrent.info_hash();
        let info_bytes = torrent.info_dict_bencode.clone();
        let mut h = harness(None, info_hash).await;
        assert_eq!(h.manager.phase_id(), PhaseId::PreMetadata);

        let (peer_tx, mut peer_rx) = mpsc::channel(64);
        h.manager
            .handle_command(TorrentCommand::PeerConnected {
                peer_id: "peer".into(),
                peer_tx,
                metadata_size: Some(info_bytes.len()),
            })
            .await;
        h.manager.tick().await.unwrap();
        assert_eq!(h.manager.phase_id(), PhaseId::Metadata);

        h.manager.tick().await.unwrap();
        let mut requested = Vec::new();
        while let Ok(message) = peer_rx.try_recv() {
            if let PeerMessage::MetadataRequest { piece } = message {
                requested.push(piece);
            }
        }
        assert_eq!(requested, vec![0]);

        h.manager
            .handle_command(TorrentCommand::MetadataBlock("peer".into(), 0, info_bytes.clone()))
            .await;
        h.scheduler.wait_idle().await;
        h.manager.tick().await.unwrap();
        assert_eq!(h.manager.phase_id(), PhaseId::Data);

        let state = h.manager.context();
        let state = state.state.lock().await;
        assert_eq!(state.file_set.as_ref().unwrap().piece_count(), 2);
        drop(state);

        // Metadata is written to the metadata folder in the background.
        let saved = h
            ._dir
            .path()
            .join("torrents")
            .join(format!("{}.torrent", data_encoding::HEXLOWER.encode(&info_hash)));
        for _ in 0..100 {
            if tokio::fs::try_exists(&saved).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let reparsed = parser::from_bytes(&tokio::fs::read(&saved).await.unwrap()).unwrap();
        assert_eq!(reparsed.info_hash(), info_hash);
    }

    #[tokio::test]
    async fn test_verify_existing_detects_complete_pieces() {
        let data = content();
        let torrent = torrent_for(&data, 25);
        let info_hash = torrent.info_hash();
        let mut h = harness(Some(torrent), info_hash).await;

        // First piece correct on disk, second corrupted.
        let mut on_disk = data.clone();
        on_disk[40] ^= 0xff;
        let path = h._dir.path().join("downloads").join("payload.bin");
        tokio::fs::write(&path, &on_disk).await.unwrap();

        let report = h.manager.verify_existing().await.unwrap();
        assert_eq!(
            report,
            VerifyReport {
                pieces_total: 2,
                pieces_done: 1
            }
        );
        let context = h.manager.context();
        let state = context.state.lock().await;
        let piece = state.file_set.as_ref().unwrap().piece(1).unwrap();
        assert_eq!(piece.count_blocks_with_status(BlockStatus::Needed), 5);
        assert_eq!(state.pending_checks, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            download_folder: Some(dir.path().to_path_buf()),
            metadata_folder: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let (_command_tx, command_rx) = mpsc::channel(4);
        let (event_tx, _events) = mpsc::channel(4);
        let (shutdown_tx, _) = broadcast::channel(1);
        let manager = TorrentManager::new(TorrentParameters {
            info_hash: [0; 20],
            torrent: None,
            settings: Arc::new(settings),
            disk_scheduler: DiskScheduler::new(),
            command_rx,
            manager_event_tx: event_tx,
            shutdown_tx: shutdown_tx.clone(),
        })
        .await
        .unwrap();

        let handle = tokio::spawn(manager.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap();
        assert!(result.unwrap().is_ok());
    }
}
