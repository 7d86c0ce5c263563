// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::Sender;

use crate::command::PeerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerDirection {
    /// Data flowing from the peer to us.
    Download,
    /// Data flowing from us to the peer.
    Upload,
}

/// Choke/interest flags for one direction of a connection.
///
/// For `Download`, `interested` means we want data from the peer and `choked`
/// means the peer refuses to send it. For `Upload`, `interested` means the
/// peer wants data from us and `choked` means we refuse to send it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientState {
    pub choked: bool,
    pub interested: bool,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            choked: true,
            interested: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub piece_index: u32,
    pub block_index: u32,
    pub requested_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    pub recorded_at: Instant,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct PeerState {
    pub ip_port: String,
    pub peer_tx: Sender<PeerMessage>,
    download: ClientState,
    upload: ClientState,
    pub request_limit: usize,
    pub pending_requests: Vec<PendingRequest>,
    pub have: HashSet<u32>,
    pub metadata_size: Option<usize>,
    pub latency_samples: VecDeque<LatencySample>,
    pub total_bytes_downloaded: u64,
    pub total_bytes_uploaded: u64,
}

impl PeerState {
    pub fn new(ip_port: String, peer_tx: Sender<PeerMessage>, request_limit: usize) -> Self {
        Self {
            ip_port,
            peer_tx,
            download: ClientState::default(),
            upload: ClientState::default(),
            request_limit: request_limit.max(1),
            pending_requests: Vec::new(),
            have: HashSet::new(),
            metadata_size: None,
            latency_samples: VecDeque::new(),
            total_bytes_downloaded: 0,
            total_bytes_uploaded: 0,
        }
    }

    pub fn client_state(&self, direction: PeerDirection) -> ClientState {
        match direction {
            PeerDirection::Download => self.download,
            PeerDirection::Upload => self.upload,
        }
    }

    fn client_state_mut(&mut self, direction: PeerDirection) -> &mut ClientState {
        match direction {
            PeerDirection::Download => &mut self.download,
            PeerDirection::Upload => &mut self.upload,
        }
    }

    pub fn is_interested(&self, direction: PeerDirection) -> bool {
        self.client_state(direction).interested
    }

    pub fn is_choked(&self, direction: PeerDirection) -> bool {
        self.client_state(direction).choked
    }

    pub fn set_interested(&mut self, direction: PeerDirection, interested: bool) {
        self.client_state_mut(direction).interested = interested;
    }

    pub fn set_choked(&mut self, direction: PeerDirection, choked: bool) {
        self.client_state_mut(direction).choked = choked;
    }

    pub fn has_piece(&self, piece_index: u32) -> bool {
        self.have.contains(&piece_index)
    }

    /// Replaces the have-set from a wire bitfield (most significant bit first).
    pub fn apply_bitfield(&mut self, bitfield: &[u8], piece_count: Option<usize>) {
        self.have.clear();
        for (byte_index, byte) in bitfield.iter().enumerate() {
            for bit in 0..8 {
                if byte & (0x80 >> bit) != 0 {
                    let piece = byte_index * 8 + bit;
                    if piece_count.map_or(true, |count| piece < count) {
                        self.have.insert(piece as u32);
                    }
                }
            }
        }
    }

    pub fn free_request_slots(&self) -> usize {
        self.request_limit.saturating_sub(self.pending_requests.len())
    }

    pub fn add_request(&mut self, piece_index: u32, block_index: u32, requested_at: Instant) {
        self.pending_requests.push(PendingRequest {
            piece_index,
            block_index,
            requested_at,
        });
    }

    /// Removes an outstanding request, returning it if it was known.
    pub fn take_request(&mut self, piece_index: u32, block_index: u32) -> Option<PendingRequest> {
        let position = self
            .pending_requests
            .iter()
            .position(|r| r.piece_index == piece_index && r.block_index == block_index)?;
        Some(self.pending_requests.remove(position))
    }

    pub fn drain_requests(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.pending_requests)
    }

    pub fn send(&self, message: PeerMessage) -> bool {
        self.peer_tx.try_send(message).is_ok()
    }
}
