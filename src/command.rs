// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;

use tokio::sync::mpsc::Sender;

/// Decoded protocol events delivered to a torrent by the network layer.
/// The first field is always the peer id (`ip:port`).
#[derive(Debug, Clone)]
pub enum TorrentCommand {
    PeerConnected {
        peer_id: String,
        peer_tx: Sender<PeerMessage>,
        // `metadata_size` from the extension handshake, if the peer sent one
        metadata_size: Option<usize>,
    },
    Disconnect(String),

    Choke(String),
    Unchoke(String),
    PeerInterested(String),
    PeerNotInterested(String),

    Have(String, u32),
    PeerBitfield(String, Vec<u8>),

    // peer, piece index, byte offset, payload
    Block(String, u32, u32, Vec<u8>),
    // peer, metadata block index, payload
    MetadataBlock(String, u32, Vec<u8>),
    // peer, piece index, byte offset, length
    RequestUpload(String, u32, u32, u32),
    // peer, piece index, block index
    Reject(String, u32, u32),
}

/// Messages queued on a peer's outbound channel for the codec to encode.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum PeerMessage {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Request { index: u32, begin: u32, length: u32 },
    MetadataRequest { piece: u32 },
    Piece { index: u32, begin: u32, data: Vec<u8> },
}

pub struct TorrentCommandSummary<'a>(pub &'a TorrentCommand);
impl fmt::Debug for TorrentCommandSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            TorrentCommand::Block(peer_id, index, begin, data) => {
                write!(
                    f,
                    "PIECE(peer: {}, index: {}, begin: {}, len: {})",
                    peer_id,
                    index,
                    begin,
                    data.len()
                )
            }
            TorrentCommand::MetadataBlock(peer_id, piece, data) => {
                write!(
                    f,
                    "METADATA(peer: {}, piece: {}, len: {})",
                    peer_id,
                    piece,
                    data.len()
                )
            }
            TorrentCommand::PeerBitfield(peer_id, bitfield) => {
                write!(
                    f,
                    "PEER_BITFIELD(peer: {}, len: {})",
                    peer_id,
                    bitfield.len()
                )
            }
            TorrentCommand::PeerConnected {
                peer_id,
                metadata_size,
                ..
            } => write!(
                f,
                "CONNECTED(peer: {}, metadata_size: {:?})",
                peer_id, metadata_size
            ),
            other => write!(f, "{:?}", other),
        }
    }
}
