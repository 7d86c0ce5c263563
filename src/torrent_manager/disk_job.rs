// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;

use tokio::sync::mpsc::Sender;
use tracing::{event, Level};

use crate::command::PeerMessage;
use crate::disk_scheduler::DiskScheduler;
use crate::errors::{JobError, PieceError};
use crate::torrent_manager::file_set::FileSetKind;
use crate::torrent_manager::piece::BlockStatus;
use crate::torrent_manager::state::TorrentState;
use crate::torrent_manager::{ManagerEvent, TorrentContext};

// Lower runs first.
pub const SEND_BLOCK_PRIORITY: u32 = 0;
pub const CHECK_HASH_PRIORITY: u32 = 3;
pub const STORE_BLOCK_PRIORITY: u32 = 10;

/// A unit of disk work against one torrent's current file set.
///
/// Every job carries the kind of file set it was created for. A job that
/// outlives its file set (the torrent moved from metadata to data) is dropped.
#[derive(Debug)]
pub enum DiskJob {
    StoreBlock {
        torrent: Arc<TorrentContext>,
        kind: FileSetKind,
        piece_index: u32,
        block_index: u32,
        data: Vec<u8>,
    },
    CheckHash {
        torrent: Arc<TorrentContext>,
        kind: FileSetKind,
        piece_index: u32,
    },
    SendBlock {
        torrent: Arc<TorrentContext>,
        peer_id: String,
        peer_tx: Sender<PeerMessage>,
        piece_index: u32,
        offset: u32,
        length: u32,
    },
}

impl DiskJob {
    pub fn priority(&self) -> u32 {
        match self {
            DiskJob::StoreBlock { .. } => STORE_BLOCK_PRIORITY,
            DiskJob::CheckHash { .. } => CHECK_HASH_PRIORITY,
            DiskJob::SendBlock { .. } => SEND_BLOCK_PRIORITY,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DiskJob::StoreBlock { .. } => "store-block",
            DiskJob::CheckHash { .. } => "check-hash",
            DiskJob::SendBlock { .. } => "send-block",
        }
    }

    pub fn piece_index(&self) -> u32 {
        match self {
            DiskJob::StoreBlock { piece_index, .. }
            | DiskJob::CheckHash { piece_index, .. }
            | DiskJob::SendBlock { piece_index, .. } => *piece_index,
        }
    }

    /// Runs the job once. `Ok` means done; an `Err` that is retryable means
    /// the piece model is unchanged and the job may simply run again.
    pub async fn process(&self, scheduler: &DiskScheduler) -> Result<(), JobError> {
        match self {
            DiskJob::StoreBlock {
                torrent,
                kind,
                piece_index,
                block_index,
                data,
            } => store_block(torrent, *kind, *piece_index, *block_index, data, scheduler).await,
            DiskJob::CheckHash {
                torrent,
                kind,
                piece_index,
            } => check_hash(torrent, *kind, *piece_index).await,
            DiskJob::SendBlock {
                torrent,
                peer_id,
                peer_tx,
                piece_index,
                offset,
                length,
            } => send_block(torrent, peer_id, peer_tx, *piece_index, *offset, *length).await,
        }
    }
}

fn matches_file_set(state: &TorrentState, kind: FileSetKind) -> bool {
    state.file_set.as_ref().is_some_and(|fs| fs.kind() == kind)
}

async fn store_block(
    torrent: &Arc<TorrentContext>,
    kind: FileSetKind,
    piece_index: u32,
    block_index: u32,
    data: &[u8],
    scheduler: &DiskScheduler,
) -> Result<(), JobError> {
    let (storage, global_offset) = {
        let mut state = torrent.state.lock().await;
        if !matches_file_set(&state, kind) {
            event!(Level::DEBUG, piece = piece_index, "Dropping block for a retired file set.");
            return Ok(());
        }
        let Some(file_set) = state.file_set.as_mut() else {
            return Ok(());
        };
        let global_offset = file_set.global_offset(piece_index, 0);
        let storage = file_set.storage();
        let piece = file_set
            .piece_mut(piece_index)
            .ok_or(PieceError::UnknownPiece { piece: piece_index })?;

        if let Err(e) = piece.check_block(block_index, data.len()) {
            // Give the block back to the selectors if it exists at all.
            let _ = piece.set_block_status(block_index, BlockStatus::Needed);
            return Err(e.into());
        }
        if matches!(
            piece.block(block_index)?.status,
            BlockStatus::Stored | BlockStatus::Verified
        ) {
            event!(Level::TRACE, piece = piece_index, block = block_index, "Duplicate block ignored.");
            return Ok(());
        }
        (storage, global_offset + piece.block_offset(block_index) as u64)
    };

    storage.write(global_offset, data).await?;

    let mut state = torrent.state.lock().await;
    if !matches_file_set(&state, kind) {
        return Ok(());
    }
    let Some(piece) = state.file_set.as_mut().and_then(|fs| fs.piece_mut(piece_index)) else {
        return Ok(());
    };
    piece.store_block(block_index, data.len())?;
    if piece.is_fully_stored() && !piece.is_done() {
        state.pending_checks += 1;
        drop(state);
        event!(Level::DEBUG, piece = piece_index, "Piece fully stored, queueing hash check.");
        scheduler.submit(DiskJob::CheckHash {
            torrent: Arc::clone(torrent),
            kind,
            piece_index,
        });
    }
    Ok(())
}

async fn check_hash(torrent: &Arc<TorrentContext>, kind: FileSetKind, piece_index: u32) -> Result<(), JobError> {
    let (storage, global_offset, length) = {
        let mut state = torrent.state.lock().await;
        if !matches_file_set(&state, kind) {
            state.pending_checks = state.pending_checks.saturating_sub(1);
            return Ok(());
        }
        let Some(file_set) = state.file_set.as_ref() else {
            return Ok(());
        };
        let storage = file_set.storage();
        let global_offset = file_set.global_offset(piece_index, 0);
        let lookup = file_set
            .piece(piece_index)
            .map(|p| (p.is_fully_stored(), p.length as usize));

        match lookup {
            Some((true, length)) => (storage, global_offset, length),
            Some((false, _)) => {
                state.pending_checks = state.pending_checks.saturating_sub(1);
                return Err(PieceError::NotStored { piece: piece_index }.into());
            }
            None => {
                state.pending_checks = state.pending_checks.saturating_sub(1);
                return Err(PieceError::UnknownPiece { piece: piece_index }.into());
            }
        }
    };

    let data = match storage.read(global_offset, length).await {
        Ok(data) => data,
        Err(e) => {
            let e = JobError::from(e);
            // A retried check still counts as pending.
            if !e.is_retryable() {
                let mut state = torrent.state.lock().await;
                state.pending_checks = state.pending_checks.saturating_sub(1);
            }
            return Err(e);
        }
    };

    let mut state = torrent.state.lock().await;
    state.pending_checks = state.pending_checks.saturating_sub(1);
    if !matches_file_set(&state, kind) {
        return Ok(());
    }
    let Some(piece) = state.file_set.as_mut().and_then(|fs| fs.piece_mut(piece_index)) else {
        return Ok(());
    };

    if !piece.check_hash(&data)? {
        let block = piece.on_hash_mismatch();
        event!(
            Level::DEBUG,
            piece = piece_index,
            block,
            "Hash mismatch, re-requesting one block."
        );
        return Ok(());
    }

    event!(Level::DEBUG, piece = piece_index, ?kind, "Piece verified.");
    match kind {
        FileSetKind::Metadata => {
            state.metadata_bytes = Some(data);
        }
        FileSetKind::Data => {
            for peer in state.peers.values() {
                peer.send(PeerMessage::Have(piece_index));
            }
        }
    }
    drop(state);
    torrent.notify(ManagerEvent::PieceVerified {
        info_hash: torrent.info_hash,
        piece_index,
    });
    Ok(())
}

async fn send_block(
    torrent: &Arc<TorrentContext>,
    peer_id: &str,
    peer_tx: &Sender<PeerMessage>,
    piece_index: u32,
    offset: u32,
    length: u32,
) -> Result<(), JobError> {
    let (storage, global_offset) = {
        let state = torrent.state.lock().await;
        let file_set = state
            .file_set
            .as_ref()
            .filter(|fs| fs.kind() == FileSetKind::Data)
            .ok_or(PieceError::UnknownPiece { piece: piece_index })?;
        let piece = file_set
            .piece(piece_index)
            .ok_or(PieceError::UnknownPiece { piece: piece_index })?;
        piece.check_range_available(offset, length)?;
        (file_set.storage(), file_set.global_offset(piece_index, offset))
    };

    let data = storage.read(global_offset, length as usize).await?;

    let message = PeerMessage::Piece {
        index: piece_index,
        begin: offset,
        data,
    };
    if peer_tx.try_send(message).is_err() {
        event!(Level::TRACE, peer = peer_id, piece = piece_index, "Peer gone or saturated, block not sent.");
        return Ok(());
    }

    let mut state = torrent.state.lock().await;
    if let Some(peer) = state.peers.get_mut(peer_id) {
        peer.total_bytes_uploaded += length as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::FlakyStorage;
    use crate::storage::{MemoryStorage, Storage};
    use crate::torrent_file::HASH_LENGTH;
    use crate::torrent_manager::file_set::FileSet;
    use crate::torrent_manager::peer::PeerState;
    use sha1::{Digest, Sha1};
    use tokio::sync::mpsc;

    fn sha(data: &[u8]) -> [u8; HASH_LENGTH] {
        Sha1::digest(data).into()
    }

    fn context(file_set: FileSet) -> (Arc<TorrentContext>, mpsc::Receiver<ManagerEvent>) {
        let (event_tx, event_rx) = mpsc::channel(16);
        let mut state = TorrentState::new([9; HASH_LENGTH], 5);
        state.file_set = Some(file_set);
        (TorrentContext::new([9; HASH_LENGTH], state, event_tx), event_rx)
    }

    fn store(torrent: &Arc<TorrentContext>, piece_index: u32, block_index: u32, data: Vec<u8>) -> DiskJob {
        DiskJob::StoreBlock {
            torrent: Arc::clone(torrent),
            kind: FileSetKind::Data,
            piece_index,
            block_index,
            data,
        }
    }

    #[test]
    fn test_priorities() {
        let (torrent, _rx) = context(
            FileSet::new(FileSetKind::Data, 4, 4, &[[0; 20]], 4, Arc::new(MemoryStorage::new(4))).unwrap(),
        );
        let job = store(&torrent, 0, 0, vec![0; 4]);
        assert_eq!(job.priority(), STORE_BLOCK_PRIORITY);
        let check = DiskJob::CheckHash {
            torrent,
            kind: FileSetKind::Data,
            piece_index: 0,
        };
        assert_eq!(check.priority(), CHECK_HASH_PRIORITY);
        assert!(SEND_BLOCK_PRIORITY < CHECK_HASH_PRIORITY);
        assert!(CHECK_HASH_PRIORITY < STORE_BLOCK_PRIORITY);
    }

    #[tokio::test]
    async fn test_store_last_block_queues_hash_check() {
        let data = vec![3u8; 10];
        let fs = FileSet::new(
            FileSetKind::Data,
            10,
            10,
            &[sha(&data)],
            5,
            Arc::new(MemoryStorage::new(10)),
        )
        .unwrap();
        let (torrent, _rx) = context(fs);
        let scheduler = DiskScheduler::new();

        store(&torrent, 0, 0, data[..5].to_vec()).process(&scheduler).await.unwrap();
        assert_eq!(scheduler.pending(), 0);
        store(&torrent, 0, 1, data[5..].to_vec()).process(&scheduler).await.unwrap();
        assert_eq!(scheduler.pending(), 1);

        let state = torrent.state.lock().await;
        assert_eq!(state.pending_checks, 1);
        assert!(state.file_set.as_ref().unwrap().piece(0).unwrap().is_fully_stored());
    }

    #[tokio::test]
    async fn test_store_wrong_length_reverts_block() {
        let fs = FileSet::new(FileSetKind::Data, 10, 10, &[[0; 20]], 5, Arc::new(MemoryStorage::new(10))).unwrap();
        let (torrent, _rx) = context(fs);
        {
            let mut state = torrent.state.lock().await;
            state.file_set.as_mut().unwrap().piece_mut(0).unwrap().get_request_block();
        }
        let result = store(&torrent, 0, 0, vec![1; 3]).process(&DiskScheduler::new()).await;
        assert!(matches!(result, Err(JobError::Domain(PieceError::LengthMismatch { .. }))));

        let state = torrent.state.lock().await;
        let block = state.file_set.as_ref().unwrap().piece(0).unwrap().blocks()[0].clone();
        assert_eq!(block.status, BlockStatus::Needed);
    }

    #[tokio::test]
    async fn test_store_io_failure_leaves_block_untouched() {
        let storage = Arc::new(FlakyStorage::new(10, 1, 0));
        let fs = FileSet::new(FileSetKind::Data, 10, 10, &[[0; 20]], 5, storage.clone()).unwrap();
        let (torrent, _rx) = context(fs);
        {
            let mut state = torrent.state.lock().await;
            state.file_set.as_mut().unwrap().piece_mut(0).unwrap().get_request_block();
        }
        let result = store(&torrent, 0, 0, vec![1; 5]).process(&DiskScheduler::new()).await;
        assert!(result.as_ref().is_err_and(|e| e.is_retryable()));

        let state = torrent.state.lock().await;
        let piece = state.file_set.as_ref().unwrap().piece(0).unwrap();
        assert_eq!(piece.blocks()[0].status, BlockStatus::Requested);
    }

    #[tokio::test]
    async fn test_check_hash_verifies_and_announces() {
        let data = vec![8u8; 10];
        let storage = Arc::new(MemoryStorage::from_bytes(data.clone()));
        let mut fs = FileSet::new(FileSetKind::Data, 10, 10, &[sha(&data)], 5, storage).unwrap();
        fs.piece_mut(0).unwrap().store_block(0, 5).unwrap();
        fs.piece_mut(0).unwrap().store_block(1, 5).unwrap();
        let (torrent, mut events) = context(fs);

        let (peer_tx, mut peer_rx) = mpsc::channel(4);
        {
            let mut state = torrent.state.lock().await;
            state.pending_checks = 1;
            state
                .peers
                .insert("p".to_string(), PeerState::new("p".to_string(), peer_tx, 5));
        }

        let job = DiskJob::CheckHash {
            torrent: Arc::clone(&torrent),
            kind: FileSetKind::Data,
            piece_index: 0,
        };
        job.process(&DiskScheduler::new()).await.unwrap();

        assert_eq!(peer_rx.recv().await, Some(PeerMessage::Have(0)));
        assert_eq!(
            events.recv().await,
            Some(ManagerEvent::PieceVerified {
                info_hash: [9; HASH_LENGTH],
                piece_index: 0
            })
        );
        let state = torrent.state.lock().await;
        assert_eq!(state.pending_checks, 0);
        assert!(state.file_set.as_ref().unwrap().is_done());
    }

    #[tokio::test]
    async fn test_failed_check_read_keeps_pending_count_honest() {
        let check = |torrent: &Arc<TorrentContext>| DiskJob::CheckHash {
            torrent: Arc::clone(torrent),
            kind: FileSetKind::Data,
            piece_index: 0,
        };

        // Transient failure: the check will run again, so it stays pending.
        let flaky = Arc::new(FlakyStorage::new(10, 0, 1));
        let mut fs = FileSet::new(FileSetKind::Data, 10, 10, &[[0; 20]], 5, flaky).unwrap();
        fs.piece_mut(0).unwrap().store_block(0, 5).unwrap();
        fs.piece_mut(0).unwrap().store_block(1, 5).unwrap();
        let (torrent, _rx) = context(fs);
        torrent.state.lock().await.pending_checks = 1;
        let result = check(&torrent).process(&DiskScheduler::new()).await;
        assert!(result.is_err_and(|e| e.is_retryable()));
        assert_eq!(torrent.state.lock().await.pending_checks, 1);

        // Permanent failure: the job is dropped, so it no longer counts.
        let short = Arc::new(MemoryStorage::new(5));
        let mut fs = FileSet::new(FileSetKind::Data, 10, 10, &[[0; 20]], 5, short).unwrap();
        fs.piece_mut(0).unwrap().store_block(0, 5).unwrap();
        fs.piece_mut(0).unwrap().store_block(1, 5).unwrap();
        let (torrent, _rx) = context(fs);
        torrent.state.lock().await.pending_checks = 1;
        let result = check(&torrent).process(&DiskScheduler::new()).await;
        assert!(result.is_err_and(|e| !e.is_retryable()));
        assert_eq!(torrent.state.lock().await.pending_checks, 0);
    }

    #[tokio::test]
    async fn test_check_hash_mismatch_reopens_one_block() {
        let storage = Arc::new(MemoryStorage::from_bytes(vec![1u8; 10]));
        let mut fs = FileSet::new(FileSetKind::Data, 10, 10, &[sha(&[2u8; 10])], 5, storage).unwrap();
        fs.piece_mut(0).unwrap().store_block(0, 5).unwrap();
        fs.piece_mut(0).unwrap().store_block(1, 5).unwrap();
        let (torrent, _rx) = context(fs);

        let job = DiskJob::CheckHash {
            torrent: Arc::clone(&torrent),
            kind: FileSetKind::Data,
            piece_index: 0,
        };
        job.process(&DiskScheduler::new()).await.unwrap();

        let state = torrent.state.lock().await;
        let piece = state.file_set.as_ref().unwrap().piece(0).unwrap();
        assert_eq!(piece.count_blocks_with_status(BlockStatus::Needed), 1);
        assert_eq!(piece.count_blocks_with_status(BlockStatus::Stored), 1);
    }

    #[tokio::test]
    async fn test_check_hash_on_metadata_keeps_bytes() {
        let info = b"d4:name4:teste".to_vec();
        let mut fs = FileSet::for_metadata(info.len(), sha(&info)).unwrap();
        fs.storage().write(0, &info).await.unwrap();
        fs.piece_mut(0).unwrap().store_block(0, info.len()).unwrap();
        let (torrent, _rx) = context(fs);

        let job = DiskJob::CheckHash {
            torrent: Arc::clone(&torrent),
            kind: FileSetKind::Metadata,
            piece_index: 0,
        };
        job.process(&DiskScheduler::new()).await.unwrap();
        assert_eq!(torrent.state.lock().await.metadata_bytes, Some(info));
    }

    #[tokio::test]
    async fn test_send_block_reads_available_range() {
        let data: Vec<u8> = (0..10).collect();
        let mut fs = FileSet::new(
            FileSetKind::Data,
            10,
            10,
            &[sha(&data)],
            5,
            Arc::new(MemoryStorage::from_bytes(data)),
        )
        .unwrap();
        fs.piece_mut(0).unwrap().store_block(1, 5).unwrap();
        let (torrent, _rx) = context(fs);
        let (peer_tx, mut peer_rx) = mpsc::channel(4);

        let job = |offset| DiskJob::SendBlock {
            torrent: Arc::clone(&torrent),
            peer_id: "p".to_string(),
            peer_tx: peer_tx.clone(),
            piece_index: 0,
            offset,
            length: 3,
        };

        let result = job(2).process(&DiskScheduler::new()).await;
        assert!(matches!(result, Err(JobError::Domain(PieceError::RangeUnavailable { .. }))));

        job(6).process(&DiskScheduler::new()).await.unwrap();
        assert_eq!(
            peer_rx.recv().await,
            Some(PeerMessage::Piece {
                index: 0,
                begin: 6,
                data: vec![6, 7, 8]
            })
        );
    }

    #[tokio::test]
    async fn test_job_for_retired_file_set_is_dropped() {
        let fs = FileSet::for_metadata(10, [0; 20]).unwrap();
        let (torrent, _rx) = context(fs);
        let result = store(&torrent, 0, 0, vec![0; 10]).process(&DiskScheduler::new()).await;
        assert!(result.is_ok());
        let state = torrent.state.lock().await;
        assert!(!state.file_set.as_ref().unwrap().piece(0).unwrap().is_started());
    }
}
