// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;

use crate::torrent_manager::file_set::FileSet;
use crate::torrent_manager::peer::PeerState;
use crate::torrent_manager::piece::{BlockStatus, Piece};

/// Number of relevant peers advertising each piece, taken once per
/// scheduling pass.
#[derive(Debug, Default, Clone)]
pub struct PieceRarity {
    counts: HashMap<u32, usize>,
}

impl PieceRarity {
    pub fn from_peers<'a, I>(peers: I) -> Self
    where
        I: IntoIterator<Item = &'a PeerState>,
    {
        let mut counts: HashMap<u32, usize> = HashMap::new();
        for peer in peers {
            for piece in &peer.have {
                *counts.entry(*piece).or_default() += 1;
            }
        }
        Self { counts }
    }

    pub fn availability(&self, piece_index: u32) -> usize {
        self.counts.get(&piece_index).copied().unwrap_or(0)
    }
}

/// Orders pieces from least to most available across a set of peers.
/// Pieces with equal availability keep their relative order.
#[derive(Debug, Default, Clone, Copy)]
pub struct PiecePrioritizer;

impl PiecePrioritizer {
    pub fn sort_by_availability<'a, 'p, I>(&self, peers: I, pieces: Vec<&'a Piece>) -> Vec<&'a Piece>
    where
        I: IntoIterator<Item = &'p PeerState>,
    {
        self.rank(&PieceRarity::from_peers(peers), pieces)
    }

    /// Same ordering against an availability snapshot already taken.
    pub fn rank<'a>(&self, rarity: &PieceRarity, mut pieces: Vec<&'a Piece>) -> Vec<&'a Piece> {
        pieces.sort_by_key(|p| rarity.availability(p.index));
        pieces
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceSelector {
    /// Requests nothing.
    #[default]
    Null,
    /// Metadata exchange: always piece 0 of the metadata file set.
    SinglePiece,
    /// Finish started pieces first, otherwise the rarest piece the peer has.
    RarestFirst,
}

impl PieceSelector {
    pub fn select_piece_for(
        &self,
        peer: &PeerState,
        file_set: &FileSet,
        rarity: &PieceRarity,
    ) -> Option<u32> {
        match self {
            PieceSelector::Null => None,
            PieceSelector::SinglePiece => file_set
                .piece(0)
                .filter(|p| p.has_block_with_status(BlockStatus::Needed))
                .map(|p| p.index),
            PieceSelector::RarestFirst => {
                let candidates = file_set
                    .needed_pieces()
                    .filter(|p| peer.has_piece(p.index))
                    .filter(|p| p.has_block_with_status(BlockStatus::Needed))
                    .collect();
                let ranked = PiecePrioritizer.rank(rarity, candidates);
                ranked
                    .iter()
                    .find(|p| p.is_started())
                    .or_else(|| ranked.first())
                    .map(|p| p.index)
            }
        }
    }
}
