// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::{Duration, Instant};

use tracing::{event, Level};

use crate::torrent_manager::peer::{LatencySample, PeerState};

pub const DEFAULT_LATENCY_WINDOW: Duration = Duration::from_secs(5);

// Seconds of transfer to keep queued at the estimated rate.
const QUEUED_SECONDS: f64 = 3.0;
const MIN_BLOCK_SECONDS: f64 = 0.001;
const MAX_DECREASE_PER_UPDATE: usize = 2;
const MAX_INCREASE_PER_UPDATE: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTransfer {
    pub received_at: Instant,
    pub duration: Duration,
}

/// Sizes each peer's in-flight request budget from how fast it has recently
/// been delivering blocks.
#[derive(Debug, Clone)]
pub struct RequestLimiter {
    window: Duration,
}

impl Default for RequestLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_WINDOW)
    }
}

impl RequestLimiter {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Records a completed transfer and moves the peer's budget toward the
    /// sustainable rate. Returns the new budget.
    pub fn on_block_received(&self, peer: &mut PeerState, transfer: &BlockTransfer) -> usize {
        peer.latency_samples.push_back(LatencySample {
            recorded_at: transfer.received_at,
            duration: transfer.duration,
        });
        self.purge(peer, transfer.received_at);

        let Some(mean) = mean_duration(peer.latency_samples.iter()) else {
            return peer.request_limit;
        };

        let target = target_request_limit(mean);
        let updated = adjust_request_limit(peer.request_limit, target);
        if updated != peer.request_limit {
            event!(
                Level::TRACE,
                peer = %peer.ip_port,
                old = peer.request_limit,
                new = updated,
                target,
                "Adjusted request limit."
            );
        }
        peer.request_limit = updated;
        updated
    }

    fn purge(&self, peer: &mut PeerState, now: Instant) {
        while let Some(oldest) = peer.latency_samples.front() {
            if now.saturating_duration_since(oldest.recorded_at) > self.window {
                peer.latency_samples.pop_front();
            } else {
                break;
            }
        }
    }
}

pub fn mean_duration<'a, I>(samples: I) -> Option<Duration>
where
    I: Iterator<Item = &'a LatencySample>,
{
    let (count, total) = samples.fold((0u32, Duration::ZERO), |(count, total), s| {
        (count + 1, total + s.duration)
    });
    if count == 0 {
        None
    } else {
        Some(total / count)
    }
}

/// Enough requests to cover `QUEUED_SECONDS` at one block per `mean`.
pub fn target_request_limit(mean: Duration) -> usize {
    let blocks_per_second = 1.0 / mean.as_secs_f64().max(MIN_BLOCK_SECONDS);
    (QUEUED_SECONDS * blocks_per_second).round() as usize
}

pub fn adjust_request_limit(current: usize, target: usize) -> usize {
    let adjusted = if target > current {
        current + std::cmp::min(target - current, MAX_INCREASE_PER_UPDATE)
    } else {
        current - std::cmp::min(current - target, MAX_DECREASE_PER_UPDATE)
    };
    adjusted.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn peer_with_limit(limit: usize) -> PeerState {
        let (tx, _rx) = mpsc::channel(1);
        PeerState::new("peer".to_string(), tx, limit)
    }

    fn fill_window(peer: &mut PeerState, base: Instant, count: u64, each: Duration) {
        for i in 0..count {
            peer.latency_samples.push_back(LatencySample {
                recorded_at: base + Duration::from_millis(i * 100),
                duration: each,
            });
        }
    }

    #[test]
    fn test_target_for_100ms_blocks() {
        let base = Instant::now();
        let mut peer = peer_with_limit(1);
        fill_window(&mut peer, base, 5, Duration::from_millis(100));
        let mean = mean_duration(peer.latency_samples.iter()).unwrap();
        assert_eq!(mean, Duration::from_millis(100));
        assert_eq!(target_request_limit(mean), 30);
    }

    #[test]
    fn test_increase_is_capped() {
        let base = Instant::now();
        let mut peer = peer_with_limit(4);
        fill_window(&mut peer, base, 4, Duration::from_millis(100));
        let limiter = RequestLimiter::default();
        let transfer = BlockTransfer {
            received_at: base + Duration::from_millis(500),
            duration: Duration::from_millis(100),
        };
        assert_eq!(limiter.on_block_received(&mut peer, &transfer), 29);
        assert_eq!(peer.request_limit, 29);
    }

    #[test]
    fn test_decrease_is_capped() {
        let base = Instant::now();
        let mut peer = peer_with_limit(40);
        fill_window(&mut peer, base, 4, Duration::from_millis(100));
        let limiter = RequestLimiter::default();
        let transfer = BlockTransfer {
            received_at: base + Duration::from_millis(500),
            duration: Duration::from_millis(100),
        };
        assert_eq!(limiter.on_block_received(&mut peer, &transfer), 38);
    }

    #[test]
    fn test_budget_floors_at_one() {
        assert_eq!(adjust_request_limit(2, 0), 1);
        assert_eq!(adjust_request_limit(1, 0), 1);
        // Slow peer: 10 seconds per block
        assert_eq!(target_request_limit(Duration::from_secs(10)), 0);
    }

    #[test]
    fn test_old_samples_are_purged() {
        let base = Instant::now();
        let mut peer = peer_with_limit(10);
        // Very slow samples that fall out of the window
        fill_window(&mut peer, base, 3, Duration::from_secs(3));
        let limiter = RequestLimiter::default();
        let transfer = BlockTransfer {
            received_at: base + Duration::from_secs(10),
            duration: Duration::from_millis(100),
        };
        limiter.on_block_received(&mut peer, &transfer);
        assert_eq!(peer.latency_samples.len(), 1);
        // Target 30 from the single fresh sample
        assert_eq!(peer.request_limit, 30);
    }

    #[test]
    fn test_tiny_durations_are_bounded() {
        assert_eq!(target_request_limit(Duration::ZERO), 3000);
    }
}
