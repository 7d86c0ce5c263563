// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

use crate::torrent_file::parser::ParseError;
use crate::torrent_manager::phase::PhaseId;

/// Caller-side mistakes against the piece model. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PieceError {
    #[error("block {block} is out of range for piece {piece}")]
    OutOfRange { piece: u32, block: u32 },
    #[error("expected {expected} bytes for block but got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("piece {piece} is not fully stored")]
    NotStored { piece: u32 },
    #[error("range {offset}+{length} of piece {piece} is not available")]
    RangeUnavailable { piece: u32, offset: u32, length: u32 },
    #[error("piece {piece} does not exist")]
    UnknownPiece { piece: u32 },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("range {offset}+{length} is outside of the stored data")]
    OutOfBounds { offset: u64, length: usize },
}

/// Outcome classification for a failed disk job.
#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Domain(#[from] PieceError),
    #[error(transparent)]
    Io(#[from] StorageError),
}

impl JobError {
    /// Device failures are transient. Bad ranges and piece-model violations
    /// will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Io(StorageError::Io(_)))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("no initial phase was registered")]
    MissingInitialPhase,
    #[error("phase {0:?} is reachable but has no registered supplier")]
    MissingSupplier(PhaseId),
}

#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("metadata could not be parsed: {0}")]
    Metadata(#[from] ParseError),
    #[error("phase requires metadata that has not been fetched")]
    MissingMetadata,
    #[error("torrent geometry is invalid: {0}")]
    InvalidGeometry(String),
}
