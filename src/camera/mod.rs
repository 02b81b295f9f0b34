//! Camera driver abstraction
//!
//! The supervisor only ever talks to a camera through [`CameraProvider`] and
//! [`CameraDevice`]. Every call may fail; the supervisor decides whether a
//! failure is transient or calls for a restart.

#[cfg(feature = "gstreamer")]
mod gst;
mod platform;
mod test_pattern;

#[cfg(feature = "gstreamer")]
pub use gst::{GstCamera, GstCameraProvider};
pub use platform::PlatformInfo;
pub use test_pattern::{TestPatternCamera, TestPatternProvider};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera not started")]
    NotStarted,

    #[error("camera is closed")]
    Closed,

    #[error("timed out waiting for a frame after {0} ms")]
    Timeout(u64),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("state change error: {0}")]
    StateChange(String),

    #[error("unsupported setting: {0}")]
    Unsupported(String),

    #[error("driver error: {0}")]
    Driver(String),
}

/// Packed pixel layout of a [`RawFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    #[serde(rename = "RGB888")]
    Rgb888,
    #[serde(rename = "BGR888")]
    Bgr888,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        3
    }

    /// Name of the matching GStreamer raw video format.
    pub fn gst_name(self) -> &'static str {
        match self {
            PixelFormat::Rgb888 => "RGB",
            PixelFormat::Bgr888 => "BGR",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Rgb888 => f.write_str("RGB888"),
            PixelFormat::Bgr888 => f.write_str("BGR888"),
        }
    }
}

impl FromStr for PixelFormat {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RGB888" | "RGB" => Ok(PixelFormat::Rgb888),
            "BGR888" | "BGR" => Ok(PixelFormat::Bgr888),
            other => Err(CameraError::Unsupported(format!("pixel format {other}"))),
        }
    }
}

/// One uncompressed frame as delivered by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl RawFrame {
    /// Number of bytes a well-formed frame of this geometry carries.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Fixed session parameters applied on every open.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps: u32,
    /// Brightness control in `-1.0..=1.0`, `0.0` is neutral.
    pub brightness: f64,
    pub flip_method: Option<String>,
    /// Upper bound on a single blocking capture call.
    pub capture_timeout_ms: u64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device: None,
            width: 480,
            height: 360,
            format: PixelFormat::Rgb888,
            fps: 5,
            brightness: 0.1,
            flip_method: None,
            capture_timeout_ms: 2000,
        }
    }
}

/// An open camera session.
///
/// Implementations are driven from a single thread at a time; the supervisor
/// serialises every call behind its handle mutex.
pub trait CameraDevice: Send {
    fn configure(&mut self, settings: &CameraSettings) -> Result<(), CameraError>;

    fn start(&mut self) -> Result<(), CameraError>;

    /// Blocks until the next frame is available or the driver gives up.
    fn capture_frame(&mut self) -> Result<RawFrame, CameraError>;

    fn stop(&mut self) -> Result<(), CameraError>;

    fn close(&mut self) -> Result<(), CameraError>;
}

/// Opens camera sessions. Called once at startup and again on every restart.
pub trait CameraProvider: Send + Sync {
    fn open(&self, settings: &CameraSettings) -> Result<Box<dyn CameraDevice>, CameraError>;

    /// Short label used in logs.
    fn name(&self) -> &str;
}
