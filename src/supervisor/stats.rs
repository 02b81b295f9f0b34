//! Capture statistics

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use super::state::SupervisorState;

/// Live counters updated by the capture thread and read by the web layer.
#[derive(Debug, Default)]
pub struct SupervisorStats {
    frames_published: AtomicU64,
    capture_failures: AtomicU64,
    encode_failures: AtomicU64,
    restarts: AtomicU64,
    failed_restarts: AtomicU64,
    state: Mutex<SupervisorState>,
}

impl SupervisorStats {
    pub(crate) fn record_publish(&self) {
        self.frames_published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_capture_failure(&self) {
        self.capture_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_encode_failure(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart(&self, succeeded: bool) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.failed_restarts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn set_state(&self, state: SupervisorState) {
        *self.state.lock() = state;
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            state: self.state(),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            failed_restarts: self.failed_restarts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SupervisorStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub state: SupervisorState,

    /// Frames encoded and published to the slot
    pub frames_published: u64,

    /// Capture calls that returned an error
    pub capture_failures: u64,

    /// Captured frames the encoder rejected
    pub encode_failures: u64,

    /// Restart sequences attempted
    pub restarts: u64,

    /// Restart sequences whose reopen failed
    pub failed_restarts: u64,
}

impl StatsSnapshot {
    /// Publish rate between two snapshots.
    pub fn calculate_fps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let frames_delta = self.frames_published.saturating_sub(previous.frames_published);
        frames_delta as f64 / elapsed_secs
    }

    /// Share of cycles that produced no frame.
    pub fn failure_rate(&self) -> f64 {
        let failures = self.capture_failures + self.encode_failures;
        let total = self.frames_published + failures;
        if total == 0 {
            return 0.0;
        }

        failures as f64 / total as f64
    }
}
