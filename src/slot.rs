//! Latest-frame holder shared between the capture thread and stream sessions.

use bytes::Bytes;
use parking_lot::RwLock;
use std::time::Instant;

#[derive(Debug, Default)]
struct Latest {
    frame: Option<Bytes>,
    sequence: u64,
    published_at: Option<Instant>,
}

/// Single-item, overwrite-on-write frame slot.
///
/// `publish` swaps in a new reference-counted buffer; readers clone the
/// handle. The lock only ever covers that swap or clone, so neither side can
/// observe a partially written frame and nobody waits on encoding or I/O.
#[derive(Debug, Default)]
pub struct LatestFrameSlot {
    latest: RwLock<Latest>,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the held frame. Returns the new sequence number.
    pub fn publish(&self, frame: Bytes) -> u64 {
        let mut latest = self.latest.write();
        latest.frame = Some(frame);
        latest.sequence += 1;
        latest.published_at = Some(Instant::now());
        latest.sequence
    }

    /// Most recently published frame, or `None` before the first publish.
    pub fn read(&self) -> Option<Bytes> {
        self.latest.read().frame.clone()
    }

    /// Frame together with its sequence number (`0` = nothing published).
    pub fn read_with_sequence(&self) -> (Option<Bytes>, u64) {
        let latest = self.latest.read();
        (latest.frame.clone(), latest.sequence)
    }

    /// Number of frames published so far.
    pub fn sequence(&self) -> u64 {
        self.latest.read().sequence
    }

    /// Wall-clock instant of the last publish.
    pub fn published_at(&self) -> Option<Instant> {
        self.latest.read().published_at
    }
}
