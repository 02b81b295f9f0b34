//! Self-healing MJPEG-over-HTTP camera streaming
//!
//! A capture thread owns the camera and keeps it alive:
//! - frames are captured at a capped rate, JPEG-encoded and published into a
//!   single shared [`LatestFrameSlot`]
//! - a camera that produces nothing for longer than the stall threshold is
//!   closed and reopened
//! - HTTP viewers each poll the slot independently and receive a
//!   `multipart/x-mixed-replace` stream
//!
//! # Example
//!
//! ```no_run
//! use picam_mjpeg::camera::{CameraSettings, TestPatternProvider};
//! use picam_mjpeg::encoder::JpegEncoder;
//! use picam_mjpeg::supervisor::{CaptureSupervisor, SupervisorConfig};
//! use picam_mjpeg::{LatestFrameSlot, ShutdownSignal};
//! use std::sync::Arc;
//!
//! let slot = Arc::new(LatestFrameSlot::new());
//! let shutdown = Arc::new(ShutdownSignal::new());
//! let supervisor = CaptureSupervisor::new(
//!     SupervisorConfig::default(),
//!     CameraSettings::default(),
//!     Box::new(TestPatternProvider),
//!     Box::new(JpegEncoder),
//!     Arc::clone(&slot),
//!     Arc::clone(&shutdown),
//! );
//! let handle = supervisor.spawn()?;
//! // ... serve `slot` over HTTP
//! shutdown.trigger();
//! # let _ = handle.join();
//! # Ok::<(), picam_mjpeg::supervisor::SupervisorError>(())
//! ```

pub mod camera;
pub mod config;
pub mod encoder;
pub mod shutdown;
pub mod slot;
pub mod stream;
pub mod supervisor;
pub mod web;

// Re-exports for convenience
pub use config::Config;
pub use shutdown::ShutdownSignal;
pub use slot::LatestFrameSlot;
pub use stream::{StreamBroadcaster, StreamSession, StreamSettings};
pub use supervisor::{CaptureSupervisor, SupervisorConfig, SupervisorError, SupervisorState};
