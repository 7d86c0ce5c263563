// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use data_encoding::HEXLOWER;
use tracing::{event, Level};

use crate::errors::{ConfigurationError, PhaseError};
use crate::torrent_file::parser;
use crate::torrent_manager::choking::ChokingStrategy;
use crate::torrent_manager::file_set::{FileSet, FileSetKind};
use crate::torrent_manager::peer::{PeerDirection, PeerState};
use crate::torrent_manager::piece_selector::PieceSelector;
use crate::torrent_manager::state::{Effect, TorrentState};
use crate::torrent_manager::ManagerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseId {
    PreMetadata,
    Metadata,
    Data,
    Seed,
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PhaseId::PreMetadata => "pre-metadata",
            PhaseId::Metadata => "metadata",
            PhaseId::Data => "data",
            PhaseId::Seed => "seed",
        };
        f.write_str(name)
    }
}

/// Everything a phase needs from outside the torrent state.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub download_folder: PathBuf,
    pub metadata_folder: PathBuf,
    pub block_size: u32,
}

/// One stage of a torrent's life. A phase installs the selector and choking
/// strategy for its stage on entry and decides when the stage is complete.
pub trait Phase: Send + Sync {
    fn id(&self) -> PhaseId;

    fn is_done(&self, state: &TorrentState) -> bool;

    fn on_enter(&mut self, state: &mut TorrentState, effects: &mut Vec<Effect>) -> Result<(), PhaseError>;

    fn on_exit(&mut self, _state: &mut TorrentState, _effects: &mut Vec<Effect>) -> Result<(), PhaseError> {
        Ok(())
    }

    fn is_relevant(&self, _peer: &PeerState) -> bool {
        true
    }
}

/// Ids of the peers the phase wants scheduled, in a stable order.
pub fn relevant_peers_for(phase: &dyn Phase, state: &TorrentState) -> Vec<String> {
    let mut ids: Vec<String> = state
        .peers
        .values()
        .filter(|peer| phase.is_relevant(peer))
        .map(|peer| peer.ip_port.clone())
        .collect();
    ids.sort();
    ids
}

/// Waiting for the size of the info dictionary, either from the `.torrent`
/// file or from a peer's extension handshake.
#[derive(Debug, Default)]
pub struct PreMetadataPhase;

impl Phase for PreMetadataPhase {
    fn id(&self) -> PhaseId {
        PhaseId::PreMetadata
    }

    fn is_done(&self, state: &TorrentState) -> bool {
        state.metadata_bytes.is_some() || state.metadata_size.is_some_and(|s| s > 0)
    }

    fn on_enter(&mut self, state: &mut TorrentState, _effects: &mut Vec<Effect>) -> Result<(), PhaseError> {
        state.selector = PieceSelector::Null;
        state.choking = ChokingStrategy::Metadata;
        Ok(())
    }

    fn on_exit(&mut self, state: &mut TorrentState, _effects: &mut Vec<Effect>) -> Result<(), PhaseError> {
        let file_set = match (&state.metadata_bytes, state.metadata_size) {
            (Some(bytes), _) => FileSet::for_known_metadata(bytes.clone(), state.info_hash)?,
            (None, Some(size)) => FileSet::for_metadata(size, state.info_hash)?,
            (None, None) => return Err(PhaseError::MissingMetadata),
        };
        state.file_set = Some(file_set);
        Ok(())
    }
}

/// Fetching the info dictionary from peers.
#[derive(Debug)]
pub struct MetadataPhase {
    metadata_folder: PathBuf,
}

impl MetadataPhase {
    pub fn new(context: &PhaseContext) -> Self {
        Self {
            metadata_folder: context.metadata_folder.clone(),
        }
    }
}

impl Phase for MetadataPhase {
    fn id(&self) -> PhaseId {
        PhaseId::Metadata
    }

    fn is_done(&self, state: &TorrentState) -> bool {
        state.metadata_bytes.is_some()
            && state
                .file_set
                .as_ref()
                .is_some_and(|fs| fs.kind() == FileSetKind::Metadata && fs.is_done())
    }

    fn on_enter(&mut self, state: &mut TorrentState, _effects: &mut Vec<Effect>) -> Result<(), PhaseError> {
        if state.file_set_kind() != Some(FileSetKind::Metadata) {
            return Err(PhaseError::MissingMetadata);
        }
        state.selector = PieceSelector::SinglePiece;
        state.choking = ChokingStrategy::Metadata;
        Ok(())
    }

    fn on_exit(&mut self, state: &mut TorrentState, effects: &mut Vec<Effect>) -> Result<(), PhaseError> {
        let info_bytes = state.metadata_bytes.as_ref().ok_or(PhaseError::MissingMetadata)?;
        let file_name = format!("{}.torrent", HEXLOWER.encode(&state.info_hash));
        effects.push(Effect::PersistMetadata {
            path: self.metadata_folder.join(file_name),
            torrent_bytes: parser::wrap_info_bytes(info_bytes),
        });
        effects.push(Effect::Notify(ManagerEvent::MetadataLoaded {
            info_hash: state.info_hash,
        }));
        Ok(())
    }

    fn is_relevant(&self, peer: &PeerState) -> bool {
        peer.metadata_size.is_some_and(|s| s > 0)
    }
}

/// Downloading and verifying the torrent content.
#[derive(Debug)]
pub struct DataPhase {
    download_folder: PathBuf,
    block_size: u32,
}

impl DataPhase {
    pub fn new(context: &PhaseContext) -> Self {
        Self {
            download_folder: context.download_folder.clone(),
            block_size: context.block_size,
        }
    }
}

impl Phase for DataPhase {
    fn id(&self) -> PhaseId {
        PhaseId::Data
    }

    // Every piece verified and no hash check still in flight.
    fn is_done(&self, state: &TorrentState) -> bool {
        state.pending_checks == 0
            && state
                .file_set
                .as_ref()
                .is_some_and(|fs| fs.kind() == FileSetKind::Data && fs.is_done())
    }

    fn on_enter(&mut self, state: &mut TorrentState, effects: &mut Vec<Effect>) -> Result<(), PhaseError> {
        let torrent = match &state.torrent {
            Some(torrent) => torrent.clone(),
            None => {
                let info_bytes = state.metadata_bytes.as_ref().ok_or(PhaseError::MissingMetadata)?;
                parser::from_info_bytes(info_bytes)?
            }
        };

        // Multi-file torrents get a directory named after the torrent.
        let root = if torrent.info.files.is_empty() {
            self.download_folder.clone()
        } else {
            self.download_folder.join(&torrent.info.name)
        };
        let file_set = FileSet::for_torrent(&torrent, &root, self.block_size)?;
        event!(
            Level::INFO,
            name = %torrent.info.name,
            pieces = file_set.piece_count(),
            bytes = file_set.total_length(),
            "Starting data download."
        );
        if let Some(layout) = file_set.layout() {
            effects.push(Effect::AllocateFiles(layout.clone()));
        }

        // Outstanding metadata requests have no meaning for the new file set.
        for peer in state.peers.values_mut() {
            peer.drain_requests();
        }
        state.pending_checks = 0;
        state.file_set = Some(file_set);
        state.torrent = Some(torrent);
        state.selector = PieceSelector::RarestFirst;
        state.choking = ChokingStrategy::PermissiveDownload;
        Ok(())
    }

    fn on_exit(&mut self, state: &mut TorrentState, effects: &mut Vec<Effect>) -> Result<(), PhaseError> {
        let tracker_urls = state.torrent.as_ref().map(|t| t.tracker_urls()).unwrap_or_default();
        effects.push(Effect::Notify(ManagerEvent::DownloadComplete {
            info_hash: state.info_hash,
        }));
        effects.push(Effect::Notify(ManagerEvent::AnnounceCompleted {
            info_hash: state.info_hash,
            tracker_urls,
        }));
        Ok(())
    }

    fn is_relevant(&self, peer: &PeerState) -> bool {
        !peer.have.is_empty() || peer.is_interested(PeerDirection::Upload) || !peer.is_choked(PeerDirection::Upload)
    }
}

/// Serving verified data. Never completes.
#[derive(Debug, Default)]
pub struct SeedPhase;

impl Phase for SeedPhase {
    fn id(&self) -> PhaseId {
        PhaseId::Seed
    }

    fn is_done(&self, _state: &TorrentState) -> bool {
        false
    }

    fn on_enter(&mut self, state: &mut TorrentState, effects: &mut Vec<Effect>) -> Result<(), PhaseError> {
        state.selector = PieceSelector::Null;
        state.choking = ChokingStrategy::UploadOnly;
        for peer in state.peers.values_mut() {
            peer.drain_requests();
            if peer.is_interested(PeerDirection::Download) {
                peer.set_interested(PeerDirection::Download, false);
                effects.push(Effect::SendToPeer {
                    peer_id: peer.ip_port.clone(),
                    message: crate::command::PeerMessage::NotInterested,
                });
            }
        }
        Ok(())
    }
}

type PhaseSupplier = Box<dyn Fn(&PhaseContext) -> Box<dyn Phase> + Send + Sync>;

struct PhaseEntry {
    supplier: PhaseSupplier,
    next: Option<PhaseId>,
}

/// Collects phase registrations and validates them into a [`PhaseChain`].
#[derive(Default)]
pub struct PhaseChainBuilder {
    initial: Option<PhaseId>,
    entries: HashMap<PhaseId, PhaseEntry>,
}

impl PhaseChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a phase and makes it the start of the chain. A later call
    /// replaces the initial phase.
    pub fn register_initial_phase<F>(mut self, id: PhaseId, supplier: F, next: Option<PhaseId>) -> Self
    where
        F: Fn(&PhaseContext) -> Box<dyn Phase> + Send + Sync + 'static,
    {
        self.initial = Some(id);
        self.register(id, supplier, next)
    }

    pub fn register_phase<F>(self, id: PhaseId, supplier: F, next: Option<PhaseId>) -> Self
    where
        F: Fn(&PhaseContext) -> Box<dyn Phase> + Send + Sync + 'static,
    {
        self.register(id, supplier, next)
    }

    fn register<F>(mut self, id: PhaseId, supplier: F, next: Option<PhaseId>) -> Self
    where
        F: Fn(&PhaseContext) -> Box<dyn Phase> + Send + Sync + 'static,
    {
        self.entries.insert(
            id,
            PhaseEntry {
                supplier: Box::new(supplier),
                next,
            },
        );
        self
    }

    pub fn build(self, context: PhaseContext) -> Result<PhaseChain, ConfigurationError> {
        let initial = self.initial.ok_or(ConfigurationError::MissingInitialPhase)?;

        let mut seen = HashSet::new();
        let mut current = Some(initial);
        while let Some(id) = current {
            if !seen.insert(id) {
                break;
            }
            let entry = self
                .entries
                .get(&id)
                .ok_or(ConfigurationError::MissingSupplier(id))?;
            current = entry.next;
        }

        Ok(PhaseChain {
            initial,
            entries: self.entries,
            context,
        })
    }
}

/// Validated phase graph. Every phase reachable from the initial one has a
/// supplier.
pub struct PhaseChain {
    initial: PhaseId,
    entries: HashMap<PhaseId, PhaseEntry>,
    context: PhaseContext,
}

impl fmt::Debug for PhaseChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseChain")
            .field("initial", &self.initial)
            .field("phases", &self.entries.len())
            .finish()
    }
}

impl PhaseChain {
    /// PreMetadata -> Metadata -> Data -> Seed.
    pub fn standard(context: PhaseContext) -> Result<Self, ConfigurationError> {
        PhaseChainBuilder::new()
            .register_initial_phase(
                PhaseId::PreMetadata,
                |_: &PhaseContext| Box::new(PreMetadataPhase) as Box<dyn Phase>,
                Some(PhaseId::Metadata),
            )
            .register_phase(
                PhaseId::Metadata,
                |ctx: &PhaseContext| Box::new(MetadataPhase::new(ctx)) as Box<dyn Phase>,
                Some(PhaseId::Data),
            )
            .register_phase(
                PhaseId::Data,
                |ctx: &PhaseContext| Box::new(DataPhase::new(ctx)) as Box<dyn Phase>,
                Some(PhaseId::Seed),
            )
            .register_phase(
                PhaseId::Seed,
                |_: &PhaseContext| Box::new(SeedPhase) as Box<dyn Phase>,
                None,
            )
            .build(context)
    }

    pub fn initial_phase_id(&self) -> PhaseId {
        self.initial
    }

    pub fn next_phase_id(&self, id: PhaseId) -> Option<PhaseId> {
        self.entries.get(&id).and_then(|entry| entry.next)
    }

    fn create(&self, id: PhaseId) -> Option<Box<dyn Phase>> {
        self.entries.get(&id).map(|entry| (entry.supplier)(&self.context))
    }

    pub fn create_initial_phase(&self) -> Result<Box<dyn Phase>, ConfigurationError> {
        self.create(self.initial)
            .ok_or(ConfigurationError::MissingSupplier(self.initial))
    }

    /// If `current` is done and has a successor, exits it, enters the
    /// successor and returns it. A phase without successor is terminal.
    pub fn advance_if_done(
        &self,
        current: &mut dyn Phase,
        state: &mut TorrentState,
        effects: &mut Vec<Effect>,
    ) -> Result<Option<Box<dyn Phase>>, PhaseError> {
        if !current.is_done(state) {
            return Ok(None);
        }
        let Some(next_id) = self.next_phase_id(current.id()) else {
            return Ok(None);
        };
        let Some(mut next) = self.create(next_id) else {
            return Ok(None);
        };

        current.on_exit(state, effects)?;
        next.on_enter(state, effects)?;
        event!(Level::INFO, from = %current.id(), to = %next_id, "Phase changed.");
        effects.push(Effect::Notify(ManagerEvent::PhaseChanged {
            info_hash: state.info_hash,
            from: current.id(),
            to: next_id,
        }));
        Ok(Some(next))
    }
}
