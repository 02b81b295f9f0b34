//! MJPEG multipart streaming
//!
//! Every viewer gets its own [`StreamSession`] polling the shared
//! [`LatestFrameSlot`]. Sessions never coordinate with each other or with the
//! capture thread: a slow viewer only slows itself down, and a viewer that
//! polls faster than the camera simply sees the same frame again.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::slot::LatestFrameSlot;

/// Multipart boundary token.
pub const BOUNDARY: &str = "frame";

/// `Content-Type` of the stream response.
pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

/// Wraps one JPEG image as a multipart chunk:
/// `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`.
pub fn encode_chunk(jpeg: &[u8]) -> Bytes {
    let mut chunk = BytesMut::with_capacity(PART_HEADER.len() + jpeg.len() + 2);
    chunk.put_slice(PART_HEADER);
    chunk.put_slice(jpeg);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Wait between reads while the slot is still empty
    pub poll_interval: Duration,
    /// Wait after each emitted chunk
    pub frame_delay: Duration,
    /// Concurrent viewer cap, `0` = unlimited
    pub max_viewers: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            frame_delay: Duration::from_millis(50),
            max_viewers: 0,
        }
    }
}

/// Hands out stream sessions over a shared slot.
pub struct StreamBroadcaster {
    slot: Arc<LatestFrameSlot>,
    settings: StreamSettings,
    viewers: Arc<AtomicUsize>,
    session_counter: AtomicU64,
    closed_tx: watch::Sender<bool>,
}

impl StreamBroadcaster {
    pub fn new(slot: Arc<LatestFrameSlot>, settings: StreamSettings) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            slot,
            settings,
            viewers: Arc::new(AtomicUsize::new(0)),
            session_counter: AtomicU64::new(0),
            closed_tx,
        }
    }

    /// Opens a session for a new viewer, or `None` if the viewer cap is reached.
    pub fn session(&self) -> Option<StreamSession> {
        let max = self.settings.max_viewers;
        let admitted = self
            .viewers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            return None;
        }

        let id = self.session_counter.fetch_add(1, Ordering::Relaxed);
        info!(viewer = id, viewers = self.viewer_count(), "Viewer connected");

        Some(StreamSession {
            id,
            slot: Arc::clone(&self.slot),
            poll_interval: self.settings.poll_interval,
            frame_delay: self.settings.frame_delay,
            closed: self.closed_tx.subscribe(),
            _guard: ViewerGuard(Arc::clone(&self.viewers)),
        })
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }

    /// Ends every running session; used on server shutdown.
    pub fn close(&self) {
        self.closed_tx.send_replace(true);
    }
}

/// Releases a viewer slot when the session goes away.
struct ViewerGuard(Arc<AtomicUsize>);

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One viewer's read loop over the slot.
pub struct StreamSession {
    id: u64,
    slot: Arc<LatestFrameSlot>,
    poll_interval: Duration,
    frame_delay: Duration,
    closed: watch::Receiver<bool>,
    _guard: ViewerGuard,
}

impl StreamSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Writes chunks into `tx` until the receiving side goes away or the
    /// broadcaster is closed. Returns the number of chunks delivered.
    ///
    /// A failed send means the peer disconnected; that is the normal end of a
    /// stream and is not reported as an error.
    pub async fn run(mut self, tx: mpsc::Sender<Bytes>) -> u64 {
        let mut sent = 0u64;

        loop {
            let Some(jpeg) = self.slot.read() else {
                if tx.is_closed() || self.pause(self.poll_interval).await {
                    break;
                }
                continue;
            };

            let delivered = tokio::select! {
                res = tx.send(encode_chunk(&jpeg)) => res.is_ok(),
                _ = wait_closed(&mut self.closed) => false,
            };
            if !delivered {
                break;
            }
            sent += 1;

            if self.pause(self.frame_delay).await {
                break;
            }
        }

        debug!(viewer = self.id, chunks = sent, "Viewer disconnected");
        sent
    }

    /// Sleeps; returns `true` if the broadcaster was closed meanwhile.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = wait_closed(&mut self.closed) => true,
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // A dropped sender also counts as closed
    let _ = closed.wait_for(|closed| *closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Instant};

    fn fast_settings() -> StreamSettings {
        StreamSettings {
            poll_interval: Duration::from_millis(5),
            frame_delay: Duration::from_millis(5),
            max_viewers: 0,
        }
    }

    #[test]
    fn test_chunk_layout() {
        let chunk = encode_chunk(b"JPEG");
        assert_eq!(
            &chunk[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG\r\n"
        );
        assert!(MJPEG_CONTENT_TYPE.ends_with(BOUNDARY));
    }

    #[tokio::test]
    async fn test_empty_slot_emits_nothing() {
        let slot = Arc::new(LatestFrameSlot::new());
        let broadcaster = StreamBroadcaster::new(Arc::clone(&slot), fast_settings());
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(broadcaster.session().unwrap().run(tx));

        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());

        slot.publish(Bytes::from_static(b"first"));
        let chunk = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(chunk.ends_with(b"first\r\n"));

        drop(rx);
        assert!(timeout(Duration::from_secs(1), task).await.is_ok());
    }

    #[tokio::test]
    async fn test_repeats_latest_frame() {
        let slot = Arc::new(LatestFrameSlot::new());
        slot.publish(Bytes::from_static(b"still"));
        let broadcaster = StreamBroadcaster::new(Arc::clone(&slot), fast_settings());
        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(broadcaster.session().unwrap().run(tx));

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!(a, b);

        slot.publish(Bytes::from_static(b"moved"));
        // Chunks of the old frame may already be queued or in flight
        let moved = timeout(Duration::from_secs(1), async {
            loop {
                let chunk = rx.recv().await.unwrap();
                if chunk.ends_with(b"moved\r\n") {
                    return chunk;
                }
                assert!(chunk.ends_with(b"still\r\n"));
            }
        })
        .await;
        assert!(moved.is_ok());
    }

    #[tokio::test]
    async fn test_write_failure_ends_session_quietly() {
        let slot = Arc::new(LatestFrameSlot::new());
        slot.publish(Bytes::from_static(b"frame"));
        let broadcaster = StreamBroadcaster::new(Arc::clone(&slot), fast_settings());
        let (tx, mut rx) = mpsc::channel(1);
        let task = tokio::spawn(broadcaster.session().unwrap().run(tx));

        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        drop(rx);

        let sent = timeout(Duration::from_millis(500), task)
            .await
            .expect("session did not stop")
            .expect("session panicked");
        assert!(sent >= 3);
        assert_eq!(broadcaster.viewer_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_detected_while_waiting_for_first_frame() {
        let slot = Arc::new(LatestFrameSlot::new());
        let broadcaster = StreamBroadcaster::new(slot, fast_settings());
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(broadcaster.session().unwrap().run(tx));

        drop(rx);
        let sent = timeout(Duration::from_millis(500), task).await.unwrap().unwrap();
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_close_ends_all_sessions() {
        let slot = Arc::new(LatestFrameSlot::new());
        slot.publish(Bytes::from_static(b"frame"));
        let settings = StreamSettings {
            frame_delay: Duration::from_secs(30),
            ..fast_settings()
        };
        let broadcaster = StreamBroadcaster::new(slot, settings);

        let mut receivers = Vec::new();
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::channel(4);
            receivers.push(rx);
            tasks.push(tokio::spawn(broadcaster.session().unwrap().run(tx)));
        }
        for rx in receivers.iter_mut() {
            rx.recv().await.unwrap();
        }

        let start = Instant::now();
        broadcaster.close();
        for task in tasks {
            assert_eq!(task.await.unwrap(), 1);
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_viewer_limit() {
        let slot = Arc::new(LatestFrameSlot::new());
        let settings = StreamSettings {
            max_viewers: 2,
            ..fast_settings()
        };
        let broadcaster = StreamBroadcaster::new(slot, settings);

        let first = broadcaster.session().unwrap();
        let second = broadcaster.session().unwrap();
        assert!(broadcaster.session().is_none());
        assert_ne!(first.id(), second.id());

        drop(first);
        assert_eq!(broadcaster.viewer_count(), 1);
        assert!(broadcaster.session().is_some());
    }
}
