//! Time source for the capture loop.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::shutdown::ShutdownSignal;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Sleeps for `duration`, waking early on shutdown.
    ///
    /// Returns `true` if the sleep was cut short by shutdown.
    fn sleep(&self, duration: Duration, shutdown: &ShutdownSignal) -> bool;
}

/// Wall clock backed by [`Instant`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration, shutdown: &ShutdownSignal) -> bool {
        shutdown.wait_timeout(duration)
    }
}

/// Simulated clock that only moves when something sleeps on it or calls
/// [`ManualClock::advance`]. Makes timing behaviour reproducible.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock() += by;
    }

    /// Simulated time since construction.
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration, shutdown: &ShutdownSignal) -> bool {
        if shutdown.is_triggered() {
            return true;
        }
        self.advance(duration);
        false
    }
}
