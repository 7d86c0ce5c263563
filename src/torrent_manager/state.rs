// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use tokio::sync::mpsc::Sender;
use tracing::{event, Level};

use crate::command::{PeerMessage, TorrentCommand};
use crate::errors::PieceError;
use crate::storage::MultiFileInfo;
use crate::torrent_file::Torrent;
use crate::torrent_manager::choking::ChokingStrategy;
use crate::torrent_manager::file_set::{FileSet, FileSetKind, MAX_METADATA_SIZE};
use crate::torrent_manager::peer::{PeerDirection, PeerState, PendingRequest};
use crate::torrent_manager::piece::BlockStatus;
use crate::torrent_manager::piece_selector::{PieceRarity, PieceSelector};
use crate::torrent_manager::request_limiter::{BlockTransfer, RequestLimiter};
use crate::torrent_manager::{InfoHash, ManagerEvent};

/// Side effects requested by the state for the manager to carry out.
#[derive(Debug, Clone)]
pub enum Effect {
    SendToPeer {
        peer_id: String,
        message: PeerMessage,
    },
    StoreBlock {
        kind: FileSetKind,
        piece_index: u32,
        block_index: u32,
        data: Vec<u8>,
    },
    SendBlock {
        peer_id: String,
        piece_index: u32,
        offset: u32,
        length: u32,
    },
    AllocateFiles(MultiFileInfo),
    PersistMetadata {
        path: PathBuf,
        torrent_bytes: Vec<u8>,
    },
    Notify(ManagerEvent),
}

#[derive(Debug)]
pub struct TorrentState {
    pub info_hash: InfoHash,
    pub torrent: Option<Torrent>,
    // Metadata size advertised by the first peer that announced one
    pub metadata_size: Option<usize>,
    // Verified bencoded info dictionary
    pub metadata_bytes: Option<Vec<u8>>,
    pub file_set: Option<FileSet>,
    pub selector: PieceSelector,
    pub choking: ChokingStrategy,
    pub limiter: RequestLimiter,
    pub peers: HashMap<String, PeerState>,
    // Hash checks queued but not yet finished
    pub pending_checks: usize,
    pub initial_request_limit: usize,
}

impl TorrentState {
    pub fn new(info_hash: InfoHash, initial_request_limit: usize) -> Self {
        Self {
            info_hash,
            torrent: None,
            metadata_size: None,
            metadata_bytes: None,
            file_set: None,
            selector: PieceSelector::default(),
            choking: ChokingStrategy::default(),
            limiter: RequestLimiter::default(),
            peers: HashMap::new(),
            pending_checks: 0,
            initial_request_limit,
        }
    }

    /// Seeds the state from a parsed `.torrent` file.
    pub fn with_torrent(mut self, torrent: Torrent) -> Self {
        self.metadata_size = Some(torrent.info_dict_bencode.len());
        self.metadata_bytes = Some(torrent.info_dict_bencode.clone());
        self.torrent = Some(torrent);
        self
    }

    pub fn file_set_kind(&self) -> Option<FileSetKind> {
        self.file_set.as_ref().map(|fs| fs.kind())
    }

    pub fn add_peer(&mut self, peer_id: String, peer_tx: Sender<PeerMessage>, metadata_size: Option<usize>) {
        let mut peer = PeerState::new(peer_id.clone(), peer_tx, self.initial_request_limit);
        peer.metadata_size = metadata_size;
        if let Some(size) = metadata_size.filter(|s| *s > 0) {
            if size > MAX_METADATA_SIZE {
                event!(Level::WARN, peer = %peer_id, size, "Ignoring oversized metadata size.");
                peer.metadata_size = None;
            } else if self.metadata_size.is_none() {
                event!(Level::DEBUG, peer = %peer_id, size, "Learned metadata size.");
                self.metadata_size = Some(size);
            }
        }
        self.peers.insert(peer_id, peer);
    }

    /// Removes a peer and hands its outstanding blocks back to the selectors.
    pub fn remove_peer(&mut self, peer_id: &str) -> Option<PeerState> {
        let mut peer = self.peers.remove(peer_id)?;
        let requests = peer.drain_requests();
        self.revert_requests(&requests);
        Some(peer)
    }

    fn revert_requests(&mut self, requests: &[PendingRequest]) {
        let Some(file_set) = self.file_set.as_mut() else {
            return;
        };
        for request in requests {
            if let Some(piece) = file_set.piece_mut(request.piece_index) {
                let requested = piece
                    .block(request.block_index)
                    .is_ok_and(|b| b.status == BlockStatus::Requested);
                if requested {
                    let _ = piece.set_block_status(request.block_index, BlockStatus::Needed);
                }
            }
        }
    }

    /// Applies one inbound protocol event. Domain errors are returned to the
    /// caller. A malformed block for a request we issued releases that request
    /// before the error is returned; otherwise the state is left unchanged.
    pub fn handle_command(&mut self, command: TorrentCommand, now: Instant) -> Result<Vec<Effect>, PieceError> {
        let mut effects = Vec::new();
        match command {
            TorrentCommand::PeerConnected {
                peer_id,
                peer_tx,
                metadata_size,
            } => self.add_peer(peer_id, peer_tx, metadata_size),
            TorrentCommand::Disconnect(peer_id) => {
                if self.remove_peer(&peer_id).is_some() {
                    event!(Level::DEBUG, peer = %peer_id, "Peer disconnected.");
                }
            }
            TorrentCommand::Choke(peer_id) => {
                let dropped = self.peers.get_mut(&peer_id).map(|peer| {
                    peer.set_choked(PeerDirection::Download, true);
                    peer.drain_requests()
                });
                if let Some(requests) = dropped {
                    self.revert_requests(&requests);
                }
            }
            TorrentCommand::Unchoke(peer_id) => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.set_choked(PeerDirection::Download, false);
                }
            }
            TorrentCommand::PeerInterested(peer_id) => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.set_interested(PeerDirection::Upload, true);
                }
            }
            TorrentCommand::PeerNotInterested(peer_id) => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.set_interested(PeerDirection::Upload, false);
                }
            }
            TorrentCommand::Have(peer_id, piece_index) => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.have.insert(piece_index);
                }
            }
            TorrentCommand::PeerBitfield(peer_id, bitfield) => {
                let piece_count = self
                    .file_set
                    .as_ref()
                    .filter(|fs| fs.kind() == FileSetKind::Data)
                    .map(|fs| fs.piece_count());
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.apply_bitfield(&bitfield, piece_count);
                }
            }
            TorrentCommand::Block(peer_id, piece_index, offset, data) => {
                let block_index = match self.file_set.as_ref() {
                    Some(fs) if fs.kind() == FileSetKind::Data => fs
                        .piece(piece_index)
                        .ok_or(PieceError::UnknownPiece { piece: piece_index })?
                        .block_index_at(offset)?,
                    _ => {
                        event!(Level::TRACE, peer = %peer_id, piece = piece_index, "Block outside data phase ignored.");
                        return Ok(effects);
                    }
                };
                if let Some(effect) =
                    self.accept_block(&peer_id, FileSetKind::Data, piece_index, block_index, data, now)?
                {
                    effects.push(effect);
                }
            }
            TorrentCommand::MetadataBlock(peer_id, block_index, data) => {
                if self.file_set_kind() != Some(FileSetKind::Metadata) {
                    event!(Level::TRACE, peer = %peer_id, block = block_index, "Unexpected metadata block ignored.");
                    return Ok(effects);
                }
                if let Some(effect) =
                    self.accept_block(&peer_id, FileSetKind::Metadata, 0, block_index, data, now)?
                {
                    effects.push(effect);
                }
            }
            TorrentCommand::RequestUpload(peer_id, piece_index, offset, length) => {
                let allowed = self
                    .peers
                    .get(&peer_id)
                    .is_some_and(|p| !p.is_choked(PeerDirection::Upload));
                if allowed && self.file_set_kind() == Some(FileSetKind::Data) {
                    effects.push(Effect::SendBlock {
                        peer_id,
                        piece_index,
                        offset,
                        length,
                    });
                } else {
                    event!(Level::TRACE, peer = %peer_id, piece = piece_index, "Upload request from choked peer ignored.");
                }
            }
            TorrentCommand::Reject(peer_id, piece_index, block_index) => {
                let rejected = self
                    .peers
                    .get_mut(&peer_id)
                    .and_then(|peer| peer.take_request(piece_index, block_index));
                if let Some(request) = rejected {
                    self.revert_requests(&[request]);
                }
            }
        }
        Ok(effects)
    }

    fn accept_block(
        &mut self,
        peer_id: &str,
        kind: FileSetKind,
        piece_index: u32,
        block_index: u32,
        data: Vec<u8>,
        now: Instant,
    ) -> Result<Option<Effect>, PieceError> {
        let Some(file_set) = self.file_set.as_ref() else {
            return Ok(None);
        };
        let piece = file_set
            .piece(piece_index)
            .ok_or(PieceError::UnknownPiece { piece: piece_index })?;
        let checked = piece
            .check_block(block_index, data.len())
            .and_then(|_| piece.block(block_index).map(|b| b.status));
        let status = match checked {
            Ok(status) => status,
            Err(e) => {
                // The block goes back to Needed and the peer's slot is freed.
                let request = self
                    .peers
                    .get_mut(peer_id)
                    .and_then(|peer| peer.take_request(piece_index, block_index));
                if let Some(request) = request {
                    self.revert_requests(&[request]);
                }
                event!(Level::DEBUG, peer = %peer_id, piece = piece_index, block = block_index, error = %e, "Malformed block.");
                return Err(e);
            }
        };

        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.total_bytes_downloaded += data.len() as u64;
            if let Some(request) = peer.take_request(piece_index, block_index) {
                let transfer = BlockTransfer {
                    received_at: now,
                    duration: now.saturating_duration_since(request.requested_at),
                };
                self.limiter.on_block_received(peer, &transfer);
            }
        }

        if matches!(status, BlockStatus::Stored | BlockStatus::Verified) {
            event!(Level::TRACE, peer = %peer_id, piece = piece_index, block = block_index, "Duplicate block.");
            return Ok(None);
        }
        Ok(Some(Effect::StoreBlock {
            kind,
            piece_index,
            block_index,
            data,
        }))
    }

    /// One scheduling pass over `relevant` peers: refreshes interest and
    /// choke flags, then fills each unchoked peer's request budget.
    pub fn tick(&mut self, relevant: &[String], now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        let rarity = PieceRarity::from_peers(relevant.iter().filter_map(|id| self.peers.get(id)));

        for peer_id in relevant {
            let Some(peer) = self.peers.get_mut(peer_id) else {
                continue;
            };

            let was_interested = peer.is_interested(PeerDirection::Download);
            let was_choking = peer.is_choked(PeerDirection::Upload);
            self.choking.update(peer, self.file_set.as_ref());

            let interested = peer.is_interested(PeerDirection::Download);
            if interested != was_interested {
                let message = if interested {
                    PeerMessage::Interested
                } else {
                    PeerMessage::NotInterested
                };
                effects.push(Effect::SendToPeer {
                    peer_id: peer_id.clone(),
                    message,
                });
            }
            let choking = peer.is_choked(PeerDirection::Upload);
            if choking != was_choking {
                let message = if choking {
                    PeerMessage::Choke
                } else {
                    PeerMessage::Unchoke
                };
                effects.push(Effect::SendToPeer {
                    peer_id: peer_id.clone(),
                    message,
                });
            }

            let Some(file_set) = self.file_set.as_mut() else {
                continue;
            };
            // Metadata requests are served regardless of choking.
            let may_request = interested
                && (file_set.kind() == FileSetKind::Metadata || !peer.is_choked(PeerDirection::Download));
            if !may_request {
                continue;
            }

            while peer.free_request_slots() > 0 {
                let Some(piece_index) = self.selector.select_piece_for(peer, file_set, &rarity) else {
                    break;
                };
                let Some(piece) = file_set.piece_mut(piece_index) else {
                    break;
                };
                let Some(block) = piece.get_request_block() else {
                    break;
                };
                let (block_index, length) = (block.index, block.size);
                let begin = piece.block_offset(block_index);

                peer.add_request(piece_index, block_index, now);
                let message = match file_set.kind() {
                    FileSetKind::Metadata => PeerMessage::MetadataRequest { piece: block_index },
                    FileSetKind::Data => PeerMessage::Request {
                        index: piece_index,
                        begin,
                        length,
                    },
                };
                effects.push(Effect::SendToPeer {
                    peer_id: peer_id.clone(),
                    message,
                });
            }
        }
        effects
    }
}
