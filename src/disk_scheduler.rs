// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::torrent_manager::disk_job::DiskJob;

const BASE_RETRY_DELAY: Duration = Duration::from_millis(10);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Linear backoff applied before a failed job re-enters the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDelay {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self {
            base: BASE_RETRY_DELAY,
            max: MAX_RETRY_DELAY,
        }
    }
}

impl RetryDelay {
    pub fn for_attempt(&self, attempts: u32) -> Duration {
        self.base.saturating_mul(attempts).min(self.max)
    }
}

/// An entry in the job queue. `sequence` is assigned once on first
/// submission and survives retries.
#[derive(Debug)]
pub struct QueuedJob<T> {
    pub priority: u32,
    pub sequence: u64,
    pub attempts: u32,
    pub job: T,
}

impl<T> PartialEq for QueuedJob<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for QueuedJob<T> {}

impl<T> PartialOrd for QueuedJob<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueuedJob<T> {
    // BinaryHeap is a max-heap: the lowest priority value and then the
    // oldest sequence must compare greatest.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Priority queue ordered by ascending priority value, FIFO within a
/// priority.
#[derive(Debug)]
pub struct JobQueue<T> {
    heap: BinaryHeap<QueuedJob<T>>,
    next_sequence: u64,
}

impl<T> Default for JobQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence: 0,
        }
    }
}

impl<T> JobQueue<T> {
    pub fn push(&mut self, priority: u32, job: T) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(QueuedJob {
            priority,
            sequence,
            attempts: 0,
            job,
        });
    }

    /// Puts a previously popped entry back in its original position.
    pub fn requeue(&mut self, entry: QueuedJob<T>) {
        self.heap.push(entry);
    }

    pub fn pop(&mut self) -> Option<QueuedJob<T>> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub processed: u64,
    pub retried: u64,
    pub dropped: u64,
    pub queued: usize,
}

#[derive(Debug, Default)]
struct SchedulerInner {
    queue: Mutex<JobQueue<DiskJob>>,
    notify: Notify,
    idle: Notify,
    shutdown: AtomicBool,
    retry_delay: RetryDelay,
    // Jobs submitted but not yet finished, including the one running and
    // those waiting out a retry delay.
    outstanding: AtomicUsize,
    // Failed jobs sleeping before they are requeued.
    backing_off: AtomicUsize,
    processed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

/// Process-wide disk queue served by a single worker task.
///
/// `submit` never waits on I/O. Jobs failing with a transient device error
/// are retried with their original queue position once their backoff has
/// elapsed, without holding up the rest of the queue. Jobs failing on a
/// piece model violation are logged and dropped.
#[derive(Debug, Clone, Default)]
pub struct DiskScheduler {
    inner: Arc<SchedulerInner>,
}

impl DiskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_delay(retry_delay: RetryDelay) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                retry_delay,
                ..Default::default()
            }),
        }
    }

    /// Spawns the worker. Must be called from within a tokio runtime.
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run().await })
    }

    pub fn submit(&self, job: DiskJob) {
        let priority = job.priority();
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        self.queue().push(priority, job);
        self.inner.notify.notify_one();
    }

    /// Number of jobs waiting in the queue.
    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            processed: self.inner.processed.load(Ordering::SeqCst),
            retried: self.inner.retried.load(Ordering::SeqCst),
            dropped: self.inner.dropped.load(Ordering::SeqCst),
            queued: self.pending(),
        }
    }

    /// Resolves once every submitted job, including follow-up jobs they
    /// submitted, has finished.
    pub async fn wait_idle(&self) {
        loop {
            // Registered before the check so a concurrent `finish` is not missed.
            let idle = self.inner.idle.notified();
            if self.inner.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, JobQueue<DiskJob>> {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self) {
        event!(Level::DEBUG, "Disk scheduler started.");
        loop {
            let next = self.queue().pop();
            match next {
                Some(entry) => self.execute(entry).await,
                None => {
                    // A retry is requeued before it stops counting as backing off.
                    if self.inner.shutdown.load(Ordering::SeqCst)
                        && self.inner.backing_off.load(Ordering::SeqCst) == 0
                        && self.queue().is_empty()
                    {
                        break;
                    }
                    self.inner.notify.notified().await;
                }
            }
        }
        event!(Level::DEBUG, "Disk scheduler stopped.");
    }

    async fn execute(&self, mut entry: QueuedJob<DiskJob>) {
        let name = entry.job.name();
        let piece = entry.job.piece_index();

        // The job runs in its own task so a panic cannot take the worker down.
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            let result = entry.job.process(&scheduler).await;
            (entry, result)
        });

        let (returned, result) = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                event!(Level::ERROR, job = name, piece, error = %e, "Disk job panicked, dropping it.");
                self.finish(&self.inner.dropped);
                return;
            }
        };
        entry = returned;

        match result {
            Ok(()) => {
                event!(Level::TRACE, job = name, piece, attempts = entry.attempts + 1, "Disk job done.");
                self.finish(&self.inner.processed);
            }
            Err(e) if e.is_retryable() => {
                entry.attempts += 1;
                self.inner.retried.fetch_add(1, Ordering::SeqCst);
                let delay = self.inner.retry_delay.for_attempt(entry.attempts);
                event!(
                    Level::WARN,
                    job = name,
                    piece,
                    attempt = entry.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Disk job failed, retrying."
                );
                self.inner.backing_off.fetch_add(1, Ordering::SeqCst);
                let scheduler = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    scheduler.queue().requeue(entry);
                    scheduler.inner.backing_off.fetch_sub(1, Ordering::SeqCst);
                    scheduler.inner.notify.notify_one();
                });
            }
            Err(e) => {
                event!(Level::WARN, job = name, piece, error = %e, "Disk job rejected, dropping it.");
                self.finish(&self.inner.dropped);
            }
        }
    }

    fn finish(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
        if self.inner.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
