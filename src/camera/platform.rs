//! Platform detection for camera sources

use std::env;
use tracing::warn;

/// Platform information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformInfo {
    /// macOS (Darwin)
    MacOS,

    /// Raspberry Pi (detected via /proc/device-tree)
    RaspberryPi,

    /// Generic Linux
    Linux,
}

impl PlatformInfo {
    /// Detects the platform we are running on.
    pub fn detect() -> Self {
        match env::consts::OS {
            "macos" => PlatformInfo::MacOS,
            "linux" if is_raspberry_pi() => PlatformInfo::RaspberryPi,
            _ => PlatformInfo::Linux,
        }
    }

    /// GStreamer source element for this platform.
    ///
    /// `device` is passed through as the element's device selector when set;
    /// otherwise the source picks its first camera.
    pub fn source_element(self, device: Option<&str>) -> String {
        match (self, device) {
            (PlatformInfo::MacOS, Some(index)) => format!("avfvideosrc device-index={index}"),
            (PlatformInfo::MacOS, None) => "avfvideosrc".to_string(),
            (PlatformInfo::RaspberryPi, Some(name)) => {
                format!("libcamerasrc camera-name=\"{name}\"")
            }
            (PlatformInfo::RaspberryPi, None) => "libcamerasrc".to_string(),
            (PlatformInfo::Linux, Some(path)) => format!("v4l2src device={path}"),
            (PlatformInfo::Linux, None) => "v4l2src device=/dev/video0".to_string(),
        }
    }
}

/// Checks if running on Raspberry Pi
fn is_raspberry_pi() -> bool {
    std::path::Path::new("/proc/device-tree/model").exists()
        || std::path::Path::new("/sys/firmware/devicetree/base/model").exists()
}

/// Maps a flip method name onto a `videoflip` element.
#[cfg_attr(not(feature = "gstreamer"), allow(dead_code))]
pub(crate) fn flip_element(method: &str) -> Option<&'static str> {
    match method {
        "vertical-flip" => Some("videoflip video-direction=5"),
        "horizontal-flip" => Some("videoflip video-direction=4"),
        "rotate-180" => Some("videoflip video-direction=2"),
        "rotate-90" => Some("videoflip video-direction=1"),
        "rotate-270" => Some("videoflip video-direction=3"),
        "none" => None,
        _ => {
            warn!(method = %method, "Unknown flip method");
            None
        }
    }
}
