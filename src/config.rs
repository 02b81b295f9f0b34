//! Configuration management

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::camera::{CameraSettings, PixelFormat};
use crate::stream::StreamSettings;
use crate::supervisor::SupervisorConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub encoder: EncoderConfig,

    #[serde(default)]
    pub supervisor: RecoveryConfig,

    #[serde(default)]
    pub stream: StreamConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind_ip
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bind-ip {:?} is not an IP address", self.bind_ip)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraConfig {
    /// Device hint; its meaning depends on the platform
    /// - macOS: "0" for the first webcam
    /// - Raspberry Pi: libcamera camera name
    /// - Linux: "/dev/video0"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    #[serde(default = "default_pixel_format")]
    pub pixel_format: PixelFormat,

    /// `-1.0..=1.0`, `0.0` is neutral
    #[serde(default = "default_brightness")]
    pub brightness: f64,

    /// Flip method (optional)
    /// - "horizontal-flip"
    /// - "vertical-flip"
    /// - "rotate-180"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flip_method: Option<String>,

    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,

    /// Use the built-in colour bar generator instead of a real camera
    #[serde(default)]
    pub test_pattern: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: None,
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            pixel_format: default_pixel_format(),
            brightness: default_brightness(),
            flip_method: None,
            capture_timeout_ms: default_capture_timeout_ms(),
            test_pattern: false,
        }
    }
}

/// JPEG encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EncoderConfig {
    /// JPEG quality (0-100)
    #[serde(default = "default_quality")]
    pub quality: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            quality: default_quality(),
        }
    }
}

/// Stall detection and recovery timings, the `[supervisor]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RecoveryConfig {
    #[serde(default = "default_stall_threshold_ms")]
    pub stall_threshold_ms: u64,

    /// Pause between closing and reopening the camera
    #[serde(default = "default_restart_settle_ms")]
    pub restart_settle_ms: u64,

    /// Pause after a failed reopen
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,

    #[serde(default = "default_startup_retry_delay_ms")]
    pub startup_retry_delay_ms: u64,

    /// Statistics reporting interval (seconds)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_seconds: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stall_threshold_ms: default_stall_threshold_ms(),
            restart_settle_ms: default_restart_settle_ms(),
            restart_backoff_ms: default_restart_backoff_ms(),
            startup_attempts: default_startup_attempts(),
            startup_retry_delay_ms: default_startup_retry_delay_ms(),
            stats_interval_seconds: default_stats_interval(),
        }
    }
}

/// Per-viewer stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StreamConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_frame_delay_ms")]
    pub frame_delay_ms: u64,

    /// 0 = unlimited
    #[serde(default)]
    pub max_viewers: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            frame_delay_ms: default_frame_delay_ms(),
            max_viewers: 0,
        }
    }
}

// Default value functions
fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5000
}
fn default_width() -> u32 {
    480
}
fn default_height() -> u32 {
    360
}
fn default_fps() -> u32 {
    5
}
fn default_pixel_format() -> PixelFormat {
    PixelFormat::Rgb888
}
fn default_brightness() -> f64 {
    0.1
}
fn default_capture_timeout_ms() -> u64 {
    2000
}
fn default_quality() -> u8 {
    40
}
fn default_stall_threshold_ms() -> u64 {
    5000
}
fn default_restart_settle_ms() -> u64 {
    500
}
fn default_restart_backoff_ms() -> u64 {
    2000
}
fn default_startup_attempts() -> u32 {
    3
}
fn default_startup_retry_delay_ms() -> u64 {
    2000
}
fn default_stats_interval() -> u64 {
    60
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_frame_delay_ms() -> u64 {
    50
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration. Called again by `main` after CLI overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind_addr()?;

        let cam = &self.camera;
        if cam.width == 0 || cam.height == 0 {
            return Err(ConfigError::Invalid(
                "camera: width and height must be > 0".to_string(),
            ));
        }

        // Most sensors and the scaler only produce even dimensions
        if cam.width % 2 != 0 || cam.height % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "camera: width and height must be even, got {}x{}",
                cam.width, cam.height
            )));
        }

        if cam.fps == 0 || cam.fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "camera: FPS must be between 1 and 120, got {}",
                cam.fps
            )));
        }

        if !(-1.0..=1.0).contains(&cam.brightness) {
            return Err(ConfigError::Invalid(format!(
                "camera: brightness must be between -1.0 and 1.0, got {}",
                cam.brightness
            )));
        }

        if cam.capture_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "camera: capture-timeout-ms must be > 0".to_string(),
            ));
        }

        if self.encoder.quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "encoder: quality must be between 0 and 100, got {}",
                self.encoder.quality
            )));
        }

        if self.supervisor.stall_threshold_ms == 0 {
            return Err(ConfigError::Invalid(
                "supervisor: stall-threshold-ms must be > 0".to_string(),
            ));
        }

        if self.supervisor.startup_attempts == 0 {
            return Err(ConfigError::Invalid(
                "supervisor: startup-attempts must be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn camera_settings(&self) -> CameraSettings {
        let cam = &self.camera;
        CameraSettings {
            device: cam.device.clone(),
            width: cam.width,
            height: cam.height,
            format: cam.pixel_format,
            fps: cam.fps,
            brightness: cam.brightness,
            flip_method: cam.flip_method.clone(),
            capture_timeout_ms: cam.capture_timeout_ms,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let sup = &self.supervisor;
        SupervisorConfig {
            fps: self.camera.fps,
            quality: self.encoder.quality,
            stall_threshold: Duration::from_millis(sup.stall_threshold_ms),
            restart_settle: Duration::from_millis(sup.restart_settle_ms),
            restart_backoff: Duration::from_millis(sup.restart_backoff_ms),
            startup_attempts: sup.startup_attempts,
            startup_retry_delay: Duration::from_millis(sup.startup_retry_delay_ms),
            stats_interval: Duration::from_secs(sup.stats_interval_seconds),
        }
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            poll_interval: Duration::from_millis(self.stream.poll_interval_ms),
            frame_delay: Duration::from_millis(self.stream.frame_delay_ms),
            max_viewers: self.stream.max_viewers,
        }
    }
}
