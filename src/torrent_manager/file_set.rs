// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::Path;
use std::sync::Arc;

use crate::errors::PhaseError;
use crate::storage::{DiskStorage, MemoryStorage, MultiFileInfo, Storage};
use crate::torrent_file::{Torrent, HASH_LENGTH};
use crate::torrent_manager::piece::Piece;

/// Block size used for the metadata exchange (ut_metadata pieces).
pub const METADATA_BLOCK_SIZE: u32 = 16_384;

/// Largest info dictionary accepted from peers.
pub const MAX_METADATA_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSetKind {
    /// The info dictionary being fetched from peers, held in memory.
    Metadata,
    /// The torrent's content, persisted to the download folder.
    Data,
}

/// The resolved set of pieces for one phase of a torrent together with the
/// storage their bytes live in.
pub struct FileSet {
    kind: FileSetKind,
    piece_length: u32,
    total_length: u64,
    pieces: Vec<Piece>,
    storage: Arc<dyn Storage>,
    layout: Option<MultiFileInfo>,
}

impl std::fmt::Debug for FileSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSet")
            .field("kind", &self.kind)
            .field("piece_length", &self.piece_length)
            .field("total_length", &self.total_length)
            .field("pieces", &self.pieces.len())
            .finish()
    }
}

impl FileSet {
    pub fn new(
        kind: FileSetKind,
        piece_length: u32,
        total_length: u64,
        hashes: &[[u8; HASH_LENGTH]],
        block_size: u32,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, PhaseError> {
        if piece_length == 0 {
            return Err(PhaseError::InvalidGeometry("piece length is zero".to_string()));
        }
        let expected_pieces = total_length.div_ceil(piece_length as u64) as usize;
        if expected_pieces != hashes.len() {
            return Err(PhaseError::InvalidGeometry(format!(
                "{} bytes need {} pieces but {} hashes were given",
                total_length,
                expected_pieces,
                hashes.len()
            )));
        }

        let pieces = hashes
            .iter()
            .enumerate()
            .map(|(i, hash)| {
                let start = i as u64 * piece_length as u64;
                let length = std::cmp::min(piece_length as u64, total_length - start) as u32;
                Piece::new(i as u32, length, *hash, block_size)
            })
            .collect();

        Ok(Self {
            kind,
            piece_length,
            total_length,
            pieces,
            storage,
            layout: None,
        })
    }

    /// Pseudo file set for the metadata exchange: a single piece spanning the
    /// whole info dictionary, verified against the info hash. The size comes
    /// from a peer and is capped at [`MAX_METADATA_SIZE`].
    pub fn for_metadata(size: usize, info_hash: [u8; HASH_LENGTH]) -> Result<Self, PhaseError> {
        if size > MAX_METADATA_SIZE {
            return Err(PhaseError::InvalidGeometry(format!(
                "metadata size {} exceeds the {} byte limit",
                size, MAX_METADATA_SIZE
            )));
        }
        Self::metadata_set(size, info_hash, Arc::new(MemoryStorage::new(size)))
    }

    /// Metadata that is already known, e.g. loaded from a `.torrent` file.
    pub fn for_known_metadata(info_bytes: Vec<u8>, info_hash: [u8; HASH_LENGTH]) -> Result<Self, PhaseError> {
        let size = info_bytes.len();
        let mut file_set = Self::metadata_set(size, info_hash, Arc::new(MemoryStorage::from_bytes(info_bytes)))?;
        for piece in &mut file_set.pieces {
            piece.mark_verified();
        }
        Ok(file_set)
    }

    fn metadata_set(size: usize, info_hash: [u8; HASH_LENGTH], storage: Arc<dyn Storage>) -> Result<Self, PhaseError> {
        let length = u32::try_from(size)
            .map_err(|_| PhaseError::InvalidGeometry(format!("metadata size {} is too large", size)))?;
        Self::new(
            FileSetKind::Metadata,
            length.max(1),
            size as u64,
            &[info_hash],
            METADATA_BLOCK_SIZE,
            storage,
        )
    }

    /// File set for the torrent's content, laid out under `root_dir`.
    pub fn for_torrent(torrent: &Torrent, root_dir: &Path, block_size: u32) -> Result<Self, PhaseError> {
        let hashes = torrent.piece_hashes()?;
        let piece_length = u32::try_from(torrent.info.piece_length)
            .map_err(|_| PhaseError::InvalidGeometry(format!("piece length {}", torrent.info.piece_length)))?;
        let layout = MultiFileInfo::new(root_dir, torrent);
        let mut file_set = Self::new(
            FileSetKind::Data,
            piece_length,
            layout.total_size,
            &hashes,
            block_size,
            Arc::new(DiskStorage::new(layout.clone())),
        )?;
        file_set.layout = Some(layout);
        Ok(file_set)
    }

    pub fn kind(&self) -> FileSetKind {
        self.kind
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_size(&self, piece_index: u32) -> Option<u32> {
        self.piece(piece_index).map(|p| p.length)
    }

    pub fn piece(&self, piece_index: u32) -> Option<&Piece> {
        self.pieces.get(piece_index as usize)
    }

    pub fn piece_mut(&mut self, piece_index: u32) -> Option<&mut Piece> {
        self.pieces.get_mut(piece_index as usize)
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// Pieces that are not yet Verified. Each call starts a fresh pass.
    pub fn needed_pieces(&self) -> impl Iterator<Item = &Piece> + '_ {
        self.pieces.iter().filter(|p| !p.is_done())
    }

    pub fn has_piece(&self, piece_index: u32) -> bool {
        self.piece(piece_index).is_some_and(|p| p.is_done())
    }

    pub fn is_done(&self) -> bool {
        self.pieces.iter().all(|p| p.is_done())
    }

    pub fn pieces_done(&self) -> usize {
        self.pieces.iter().filter(|p| p.is_done()).count()
    }

    /// Offset of `offset` within `piece_index` in the concatenated data stream.
    pub fn global_offset(&self, piece_index: u32, offset: u32) -> u64 {
        piece_index as u64 * self.piece_length as u64 + offset as u64
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    /// On-disk layout, present only for data file sets.
    pub fn layout(&self) -> Option<&MultiFileInfo> {
        self.layout.as_ref()
    }
}
