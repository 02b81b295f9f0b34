//! Capture supervisor states and stall detection

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle of the capture supervisor.
///
/// `Uninitialized → Running → Stalled → Restarting → Running → …`;
/// `Stopped` is only entered on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    #[default]
    Uninitialized,
    Running,
    Stalled,
    Restarting,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Uninitialized => "uninitialized",
            SupervisorState::Running => "running",
            SupervisorState::Stalled => "stalled",
            SupervisorState::Restarting => "restarting",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Tracks the last successful frame and decides when the camera is stalled.
#[derive(Debug, Clone)]
pub struct StallDetector {
    last_success: Instant,
    threshold: Duration,
}

impl StallDetector {
    pub fn new(now: Instant, threshold: Duration) -> Self {
        Self {
            last_success: now,
            threshold,
        }
    }

    pub fn record_success(&mut self, now: Instant) {
        self.last_success = now;
    }

    /// Restarts the stall window after a restart attempt, successful or not.
    pub fn reset(&mut self, now: Instant) {
        self.last_success = now;
    }

    pub fn since_success(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_success)
    }

    /// Stalled once strictly more than `threshold` has passed without a frame.
    pub fn is_stalled(&self, now: Instant) -> bool {
        self.since_success(now) > self.threshold
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }
}
