// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::torrent_manager::file_set::FileSet;
use crate::torrent_manager::peer::{PeerDirection, PeerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChokingStrategy {
    /// Interested in peers that advertise metadata; never uploads.
    #[default]
    Metadata,
    /// Interested in peers that have a piece we need; unchokes every peer
    /// that is interested in us.
    PermissiveDownload,
    /// Seeding: unchokes every interested peer, leaves download interest alone.
    UploadOnly,
}

impl ChokingStrategy {
    pub fn update(&self, peer: &mut PeerState, file_set: Option<&FileSet>) {
        match self {
            ChokingStrategy::Metadata => {
                let has_metadata = peer.metadata_size.is_some_and(|size| size > 0);
                peer.set_interested(PeerDirection::Download, has_metadata);
                peer.set_choked(PeerDirection::Upload, true);
            }
            ChokingStrategy::PermissiveDownload => {
                let wants_something = file_set
                    .is_some_and(|fs| fs.needed_pieces().any(|p| peer.has_piece(p.index)));
                peer.set_interested(PeerDirection::Download, wants_something);
                Self::unchoke_if_interested(peer);
            }
            ChokingStrategy::UploadOnly => Self::unchoke_if_interested(peer),
        }
    }

    fn unchoke_if_interested(peer: &mut PeerState) {
        let they_want_data = peer.is_interested(PeerDirection::Upload);
        peer.set_choked(PeerDirection::Upload, !they_want_data);
    }
}
