// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use sha1::{Digest, Sha1};

use crate::errors::PieceError;
use crate::torrent_file::HASH_LENGTH;

#[derive(PartialEq, Eq, Clone, Copy, Debug, Default, Hash)]
pub enum BlockStatus {
    #[default]
    Needed,
    Requested,
    Stored,
    Verified,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub index: u32,
    pub size: u32,
    pub status: BlockStatus,
}

/// A contiguous, independently hashed range of torrent data, split into
/// request-sized blocks. The last block may be shorter than `block_size`.
#[derive(Debug, Clone)]
pub struct Piece {
    pub index: u32,
    pub length: u32,
    pub hash: [u8; HASH_LENGTH],
    pub block_size: u32,
    blocks: Vec<Block>,
    // Next block to invalidate on a hash mismatch.
    mismatch_cursor: usize,
}

impl Piece {
    pub fn new(index: u32, length: u32, hash: [u8; HASH_LENGTH], block_size: u32) -> Self {
        let block_size = block_size.max(1);
        let block_count = length.div_ceil(block_size);
        let blocks = (0..block_count)
            .map(|i| Block {
                index: i,
                size: std::cmp::min(block_size, length - i * block_size),
                status: BlockStatus::Needed,
            })
            .collect();

        Self {
            index,
            length,
            hash,
            block_size,
            blocks,
            mismatch_cursor: 0,
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, block_index: u32) -> Result<&Block, PieceError> {
        self.blocks
            .get(block_index as usize)
            .ok_or(PieceError::OutOfRange {
                piece: self.index,
                block: block_index,
            })
    }

    /// Byte offset of a block within this piece.
    pub fn block_offset(&self, block_index: u32) -> u32 {
        block_index * self.block_size
    }

    /// Maps a byte offset within the piece to the block starting there.
    pub fn block_index_at(&self, offset: u32) -> Result<u32, PieceError> {
        let block = offset / self.block_size;
        if offset % self.block_size != 0 || block as usize >= self.blocks.len() {
            return Err(PieceError::OutOfRange {
                piece: self.index,
                block,
            });
        }
        Ok(block)
    }

    pub fn count_blocks_with_status(&self, status: BlockStatus) -> usize {
        self.blocks.iter().filter(|b| b.status == status).count()
    }

    pub fn has_block_with_status(&self, status: BlockStatus) -> bool {
        self.blocks.iter().any(|b| b.status == status)
    }

    pub fn is_started(&self) -> bool {
        self.blocks.iter().any(|b| b.status != BlockStatus::Needed)
    }

    pub fn is_done(&self) -> bool {
        self.blocks.iter().all(|b| b.status == BlockStatus::Verified)
    }

    pub fn is_fully_stored(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| matches!(b.status, BlockStatus::Stored | BlockStatus::Verified))
    }

    /// Claims the first Needed block, marking it Requested.
    pub fn get_request_block(&mut self) -> Option<&Block> {
        let block = self
            .blocks
            .iter_mut()
            .find(|b| b.status == BlockStatus::Needed)?;
        block.status = BlockStatus::Requested;
        Some(&*block)
    }

    pub fn set_block_status(&mut self, block_index: u32, status: BlockStatus) -> Result<(), PieceError> {
        let piece = self.index;
        let block = self
            .blocks
            .get_mut(block_index as usize)
            .ok_or(PieceError::OutOfRange {
                piece,
                block: block_index,
            })?;
        block.status = status;
        Ok(())
    }

    /// Validates that `length` bytes is the exact size of `block_index`.
    pub fn check_block(&self, block_index: u32, length: usize) -> Result<(), PieceError> {
        let block = self.block(block_index)?;
        if block.size as usize != length {
            return Err(PieceError::LengthMismatch {
                expected: block.size as usize,
                actual: length,
            });
        }
        Ok(())
    }

    /// Marks a block Stored after its bytes were persisted.
    pub fn store_block(&mut self, block_index: u32, length: usize) -> Result<(), PieceError> {
        self.check_block(block_index, length)?;
        self.set_block_status(block_index, BlockStatus::Stored)
    }

    /// Compares the SHA-1 of the full piece bytes with the expected hash.
    /// On a match every block becomes Verified; on a mismatch the state is
    /// left untouched for [`Piece::on_hash_mismatch`].
    pub fn check_hash(&mut self, data: &[u8]) -> Result<bool, PieceError> {
        if !self.is_fully_stored() {
            return Err(PieceError::NotStored { piece: self.index });
        }
        if data.len() != self.length as usize {
            return Err(PieceError::LengthMismatch {
                expected: self.length as usize,
                actual: data.len(),
            });
        }

        let digest: [u8; HASH_LENGTH] = Sha1::digest(data).into();
        if digest != self.hash {
            return Ok(false);
        }
        for block in &mut self.blocks {
            block.status = BlockStatus::Verified;
        }
        Ok(true)
    }

    /// Returns exactly one block to Needed, rotating through the blocks so
    /// repeated mismatches eventually re-fetch the whole piece.
    pub fn on_hash_mismatch(&mut self) -> u32 {
        if self.blocks.is_empty() {
            return 0;
        }
        let block_index = self.mismatch_cursor;
        self.blocks[block_index].status = BlockStatus::Needed;
        self.mismatch_cursor = (self.mismatch_cursor + 1) % self.blocks.len();
        block_index as u32
    }

    /// Fails unless `offset..offset + length` is entirely covered by Stored or
    /// Verified blocks.
    pub fn check_range_available(&self, offset: u32, length: u32) -> Result<(), PieceError> {
        let unavailable = PieceError::RangeUnavailable {
            piece: self.index,
            offset,
            length,
        };
        let end = offset.checked_add(length).ok_or(unavailable.clone())?;
        if length == 0 || end > self.length {
            return Err(unavailable);
        }

        let first = offset / self.block_size;
        let last = (end - 1) / self.block_size;
        let available = self.blocks[first as usize..=last as usize]
            .iter()
            .all(|b| matches!(b.status, BlockStatus::Stored | BlockStatus::Verified));
        if available {
            Ok(())
        } else {
            Err(unavailable)
        }
    }

    /// Puts every Requested block back to Needed.
    pub fn reset_requested(&mut self) {
        for block in &mut self.blocks {
            if block.status == BlockStatus::Requested {
                block.status = BlockStatus::Needed;
            }
        }
    }

    pub fn mark_verified(&mut self) {
        for block in &mut self.blocks {
            block.status = BlockStatus::Verified;
        }
    }
}
