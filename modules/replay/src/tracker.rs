//! Completion tracking for the replay worker pool.
//!
//! The watermark is the highest height `h` such that every height in
//! `[start_height, h]` has been marked done. Individual transactions are
//! tracked in a bounded map that is garbage-collected as the watermark
//! advances past their height, so memory stays proportional to the
//! in-flight window.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sundae_sync_common::{DependencyWaits, WaitError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct TrackerState {
    completed: HashSet<u64>,
    tx_to_height: HashMap<String, u64>,
    height_txs: HashMap<u64, Vec<String>>,
    watermark: u64,
}

/// Counters describing `wait_for_tx` behaviour over a replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitStats {
    /// Total `wait_for_tx` calls
    pub calls: u64,
    /// Calls that actually parked on the broadcast
    pub parked: u64,
    /// Calls that fell through because the hash predates the window
    pub bailouts: u64,
    /// Cumulative parked time, in nanoseconds
    pub parked_nanos: u64,
}

impl WaitStats {
    pub fn parked_duration(&self) -> Duration {
        Duration::from_nanos(self.parked_nanos)
    }
}

pub struct HeightTracker {
    state: Mutex<TrackerState>,

    /// Broadcast: the generation bumps on every state change, waking all
    /// waiters. Bumped while `state` is held.
    notify: watch::Sender<u64>,

    calls: AtomicU64,
    parked: AtomicU64,
    bailouts: AtomicU64,
    parked_nanos: AtomicU64,
}

impl HeightTracker {
    pub fn new(start_height: u64) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                watermark: start_height.saturating_sub(1),
                ..TrackerState::default()
            }),
            notify: watch::channel(0).0,
            calls: AtomicU64::new(0),
            parked: AtomicU64::new(0),
            bailouts: AtomicU64::new(0),
            parked_nanos: AtomicU64::new(0),
        }
    }

    pub fn watermark(&self) -> u64 {
        self.state.lock().unwrap().watermark
    }

    pub fn wait_stats(&self) -> WaitStats {
        WaitStats {
            calls: self.calls.load(Ordering::Relaxed),
            parked: self.parked.load(Ordering::Relaxed),
            bailouts: self.bailouts.load(Ordering::Relaxed),
            parked_nanos: self.parked_nanos.load(Ordering::Relaxed),
        }
    }

    /// Record a fully-processed transaction, waking any waiters
    pub fn mark_tx_processed(&self, tx_hash: &str, height: u64) {
        let mut state = self.state.lock().unwrap();
        state.tx_to_height.insert(tx_hash.to_string(), height);
        state
            .height_txs
            .entry(height)
            .or_default()
            .push(tx_hash.to_string());
        self.notify.send_modify(|gen| *gen += 1);
    }

    /// Mark a height complete, advancing the watermark over any contiguous
    /// run it finishes and GC-ing tx entries that fall at or below it
    pub fn mark_done(&self, height: u64) {
        let mut state = self.state.lock().unwrap();
        state.completed.insert(height);

        let old_watermark = state.watermark;
        while {
            let next = state.watermark + 1;
            state.completed.remove(&next)
        } {
            state.watermark += 1;
        }

        if state.watermark > old_watermark {
            for h in old_watermark + 1..=state.watermark {
                if let Some(hashes) = state.height_txs.remove(&h) {
                    for hash in hashes {
                        state.tx_to_height.remove(&hash);
                    }
                }
            }
            self.notify.send_modify(|gen| *gen += 1);
        }
    }
}

#[async_trait]
impl DependencyWaits for HeightTracker {
    async fn wait_for_height(
        &self,
        height: u64,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        loop {
            // subscribe before checking so a bump between the check and the
            // await is never lost
            let mut changed = self.notify.subscribe();
            {
                let state = self.state.lock().unwrap();
                if state.watermark >= height {
                    return Ok(());
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                _ = changed.changed() => {}
            }
        }
    }

    async fn wait_for_tx(
        &self,
        tx_hash: &str,
        current_height: u64,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut park_started: Option<Instant> = None;

        let settle = |parked: &Option<Instant>| {
            if let Some(started) = parked {
                self.parked_nanos
                    .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
            }
        };

        loop {
            let mut changed = self.notify.subscribe();
            {
                let state = self.state.lock().unwrap();
                if state.tx_to_height.contains_key(tx_hash) {
                    settle(&park_started);
                    return Ok(());
                }
                // Everything before this block has finished and the hash
                // never showed up: it predates the replay window (or was
                // already GC'd, which is indistinguishable and equally
                // safe). The caller falls through to its store lookup.
                if state.watermark >= current_height.saturating_sub(1) {
                    self.bailouts.fetch_add(1, Ordering::Relaxed);
                    settle(&park_started);
                    return Ok(());
                }
            }

            if park_started.is_none() {
                self.parked.fetch_add(1, Ordering::Relaxed);
                park_started = Some(Instant::now());
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    settle(&park_started);
                    return Err(WaitError::Cancelled);
                }
                _ = changed.changed() => {}
            }
        }
    }
}
