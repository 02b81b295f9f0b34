//! Capture supervisor
//!
//! Owns the camera session and runs the capture → encode → publish → pace
//! cycle on a dedicated thread. A stalled camera (no frame for longer than the
//! stall threshold) is closed and reopened; a failed reopen is throttled by a
//! fixed backoff and never takes the process down.

mod clock;
mod state;
mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use state::{StallDetector, SupervisorState};
pub use stats::{StatsSnapshot, SupervisorStats};

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::camera::{CameraDevice, CameraError, CameraProvider, CameraSettings};
use crate::encoder::FrameEncoder;
use crate::shutdown::ShutdownSignal;
use crate::slot::LatestFrameSlot;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("camera failed to start after {attempts} attempt(s): {source}")]
    Startup {
        attempts: u32,
        #[source]
        source: CameraError,
    },

    #[error("shutdown requested during startup")]
    Cancelled,

    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Timing and quality knobs for the capture loop.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub fps: u32,
    pub quality: u8,
    pub stall_threshold: Duration,
    pub restart_settle: Duration,
    pub restart_backoff: Duration,
    pub startup_attempts: u32,
    pub startup_retry_delay: Duration,
    pub stats_interval: Duration,
}

impl SupervisorConfig {
    /// Minimum time between cycle starts.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            fps: 5,
            quality: 40,
            stall_threshold: Duration::from_secs(5),
            restart_settle: Duration::from_millis(500),
            restart_backoff: Duration::from_secs(2),
            startup_attempts: 3,
            startup_retry_delay: Duration::from_secs(2),
            stats_interval: Duration::from_secs(60),
        }
    }
}

/// What happened to the frame in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Published { sequence: u64 },
    CaptureFailed,
    EncodeFailed,
}

/// Result of a restart sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Reopened,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cycle {
    pub frame: CycleOutcome,
    pub restart: Option<RestartOutcome>,
}

pub struct CaptureSupervisor {
    config: SupervisorConfig,
    settings: CameraSettings,
    provider: Box<dyn CameraProvider>,
    encoder: Box<dyn FrameEncoder>,
    slot: Arc<LatestFrameSlot>,
    stats: Arc<SupervisorStats>,
    shutdown: Arc<ShutdownSignal>,
    clock: Arc<dyn Clock>,

    // Guards capture calls and the whole restart sequence
    camera: Mutex<Option<Box<dyn CameraDevice>>>,
    stall: StallDetector,
}

impl CaptureSupervisor {
    pub fn new(
        config: SupervisorConfig,
        settings: CameraSettings,
        provider: Box<dyn CameraProvider>,
        encoder: Box<dyn FrameEncoder>,
        slot: Arc<LatestFrameSlot>,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let stall = StallDetector::new(clock.now(), config.stall_threshold);

        Self {
            config,
            settings,
            provider,
            encoder,
            slot,
            stats: Arc::new(SupervisorStats::default()),
            shutdown,
            clock,
            camera: Mutex::new(None),
            stall,
        }
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.stall = StallDetector::new(clock.now(), self.config.stall_threshold);
        self.clock = clock;
        self
    }

    pub fn stats(&self) -> Arc<SupervisorStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> SupervisorState {
        self.stats.state()
    }

    /// Runs the supervisor on its own named thread.
    pub fn spawn(self) -> Result<JoinHandle<Result<(), SupervisorError>>, SupervisorError> {
        let handle = thread::Builder::new()
            .name("capture-supervisor".to_string())
            .spawn(move || self.run())?;
        Ok(handle)
    }

    /// Opens the camera and loops until shutdown.
    pub fn run(mut self) -> Result<(), SupervisorError> {
        match self.start() {
            Ok(()) => {}
            Err(SupervisorError::Cancelled) => {
                self.stats.set_state(SupervisorState::Stopped);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let mut last_report = self.clock.now();
        let mut previous = self.stats.snapshot();

        while !self.shutdown.is_triggered() {
            self.step();

            let now = self.clock.now();
            let since_report = now.saturating_duration_since(last_report);
            if since_report >= self.config.stats_interval {
                let current = self.stats.snapshot();
                info!(
                    fps = %format!("{:.1}", current.calculate_fps(&previous, since_report.as_secs_f64())),
                    published = %current.frames_published,
                    capture_failures = %current.capture_failures,
                    encode_failures = %current.encode_failures,
                    restarts = %current.restarts,
                    "Capture stats"
                );
                previous = current;
                last_report = now;
            }
        }

        let device = self.camera.lock().take();
        if let Some(device) = device {
            close_device(device);
        }
        self.stats.set_state(SupervisorState::Stopped);
        info!("Capture supervisor stopped");

        Ok(())
    }

    /// `Uninitialized → Running`: opens the camera, retrying a bounded number
    /// of times before giving up.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        let attempts = self.config.startup_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let opened = {
                let mut camera = self.camera.lock();
                self.open_camera(&mut camera)
            };

            match opened {
                Ok(()) => {
                    info!(
                        camera = %self.provider.name(),
                        resolution = %format!("{}x{}", self.settings.width, self.settings.height),
                        format = %self.settings.format,
                        fps = %self.config.fps,
                        brightness = %self.settings.brightness,
                        "Camera started"
                    );
                    self.stall.reset(self.clock.now());
                    self.stats.set_state(SupervisorState::Running);
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "Camera failed to start, retrying");
                    if self.clock.sleep(self.config.startup_retry_delay, &self.shutdown) {
                        return Err(SupervisorError::Cancelled);
                    }
                }
                Err(e) => {
                    error!(attempts, error = ?e, "Camera failed to start");
                    return Err(SupervisorError::Startup { attempts, source: e });
                }
            }
        }
    }

    /// Runs one cycle: capture, encode, publish, stall check, pacing.
    pub fn step(&mut self) -> Cycle {
        let t0 = self.clock.now();

        let frame = self.capture_and_publish();

        let now = self.clock.now();
        let restart = if self.stall.is_stalled(now) {
            Some(self.restart(now))
        } else {
            None
        };

        let elapsed = self.clock.now().saturating_duration_since(t0);
        let interval = self.config.frame_interval();
        if elapsed < interval {
            self.clock.sleep(interval - elapsed, &self.shutdown);
        }

        Cycle { frame, restart }
    }

    fn capture_and_publish(&mut self) -> CycleOutcome {
        let captured = {
            let mut camera = self.camera.lock();
            match camera.as_mut() {
                Some(device) => device.capture_frame(),
                None => Err(CameraError::Closed),
            }
        };

        let raw = match captured {
            Ok(raw) => raw,
            Err(e) => {
                self.stats.record_capture_failure();
                warn!(error = %e, "Capture failed");
                return CycleOutcome::CaptureFailed;
            }
        };

        match self.encoder.encode(&raw, self.config.quality) {
            Ok(jpeg) => {
                let sequence = self.slot.publish(jpeg);
                self.stall.record_success(self.clock.now());
                self.stats.record_publish();
                CycleOutcome::Published { sequence }
            }
            Err(e) => {
                self.stats.record_encode_failure();
                warn!(error = %e, "Encode failed");
                CycleOutcome::EncodeFailed
            }
        }
    }

    /// `Stalled → Restarting → Running`.
    fn restart(&mut self, now: Instant) -> RestartOutcome {
        self.stats.set_state(SupervisorState::Stalled);
        error!(
            stalled_for_ms = %self.stall.since_success(now).as_millis(),
            threshold_ms = %self.stall.threshold().as_millis(),
            "Camera appears stalled, restarting camera"
        );
        self.stats.set_state(SupervisorState::Restarting);

        let reopened = {
            let mut camera = self.camera.lock();
            if let Some(device) = camera.take() {
                close_device(device);
            }

            if self.clock.sleep(self.config.restart_settle, &self.shutdown) {
                None
            } else {
                Some(self.open_camera(&mut camera))
            }
        };

        let outcome = match reopened {
            None => {
                info!("Restart abandoned, shutting down");
                RestartOutcome::Cancelled
            }
            Some(Ok(())) => {
                self.stats.record_restart(true);
                info!("Camera restarted");
                RestartOutcome::Reopened
            }
            Some(Err(e)) => {
                self.stats.record_restart(false);
                error!(
                    error = ?e,
                    backoff_ms = %self.config.restart_backoff.as_millis(),
                    "Camera restart failed"
                );
                self.clock.sleep(self.config.restart_backoff, &self.shutdown);
                RestartOutcome::Failed
            }
        };

        // Reset regardless of outcome so a dead camera is retried once per window
        self.stall.reset(self.clock.now());
        self.stats.set_state(SupervisorState::Running);
        outcome
    }

    /// Opens, configures and starts a session into `camera`, which callers
    /// pass in from under the camera lock.
    fn open_camera(&self, camera: &mut Option<Box<dyn CameraDevice>>) -> Result<(), CameraError> {
        let mut device = self.provider.open(&self.settings)?;

        let started = device
            .configure(&self.settings)
            .and_then(|_| device.start());
        if let Err(e) = started {
            if let Err(close_err) = device.close() {
                debug!(error = %close_err, "Close after failed start also failed");
            }
            return Err(e);
        }

        *camera = Some(device);
        Ok(())
    }
}

/// Best-effort stop + close; failures are logged and dropped.
fn close_device(mut device: Box<dyn CameraDevice>) {
    if let Err(e) = device.stop() {
        debug!(error = %e, "Camera stop failed");
    }
    if let Err(e) = device.close() {
        debug!(error = %e, "Camera close failed");
    }
    info!("Camera stopped/closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{PixelFormat, RawFrame};
    use crate::encoder::EncodeError;
    use bytes::Bytes;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Open,
        Configure,
        Start,
        Capture,
        Stop,
        Close,
    }

    #[derive(Debug, Clone, Copy)]
    enum Shot {
        Frame(u8),
        Fail,
        Corrupt,
    }

    struct MockState {
        events: Mutex<Vec<Event>>,
        shots: Mutex<VecDeque<Shot>>,
        fallback: Shot,
        fail_opens: Mutex<VecDeque<bool>>,
        latency: Duration,
        clock: Arc<ManualClock>,
    }

    impl MockState {
        fn log(&self, event: Event) {
            self.events.lock().push(event);
        }

        fn count(&self, event: Event) -> usize {
            self.events.lock().iter().filter(|e| **e == event).count()
        }
    }

    struct MockProvider(Arc<MockState>);

    impl CameraProvider for MockProvider {
        fn open(&self, _settings: &CameraSettings) -> Result<Box<dyn CameraDevice>, CameraError> {
            self.0.log(Event::Open);
            if self.0.fail_opens.lock().pop_front().unwrap_or(false) {
                return Err(CameraError::Driver("no camera".to_string()));
            }
            Ok(Box::new(MockDevice(Arc::clone(&self.0))))
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    struct MockDevice(Arc<MockState>);

    impl CameraDevice for MockDevice {
        fn configure(&mut self, _settings: &CameraSettings) -> Result<(), CameraError> {
            self.0.log(Event::Configure);
            Ok(())
        }

        fn start(&mut self) -> Result<(), CameraError> {
            self.0.log(Event::Start);
            Ok(())
        }

        fn capture_frame(&mut self) -> Result<RawFrame, CameraError> {
            self.0.log(Event::Capture);
            self.0.clock.advance(self.0.latency);
            let shot = self.0.shots.lock().pop_front().unwrap_or(self.0.fallback);
            match shot {
                Shot::Frame(n) => Ok(RawFrame {
                    width: 1,
                    height: 1,
                    format: PixelFormat::Rgb888,
                    data: vec![n; 3],
                }),
                Shot::Corrupt => Ok(RawFrame {
                    width: 1,
                    height: 1,
                    format: PixelFormat::Rgb888,
                    data: Vec::new(),
                }),
                Shot::Fail => Err(CameraError::Timeout(1000)),
            }
        }

        fn stop(&mut self) -> Result<(), CameraError> {
            self.0.log(Event::Stop);
            Err(CameraError::Driver("stop failed".to_string()))
        }

        fn close(&mut self) -> Result<(), CameraError> {
            self.0.log(Event::Close);
            Ok(())
        }
    }

    /// Encodes a frame as `jpeg-<first byte>`.
    struct TagEncoder;

    impl FrameEncoder for TagEncoder {
        fn encode(&self, frame: &RawFrame, _quality: u8) -> Result<Bytes, EncodeError> {
            if frame.data.len() != frame.expected_len() {
                return Err(EncodeError::SizeMismatch {
                    expected: frame.expected_len(),
                    actual: frame.data.len(),
                });
            }
            Ok(Bytes::from(format!("jpeg-{}", frame.data[0])))
        }
    }

    struct Harness {
        supervisor: CaptureSupervisor,
        mock: Arc<MockState>,
        clock: Arc<ManualClock>,
        slot: Arc<LatestFrameSlot>,
    }

    impl Harness {
        fn new(fps: u32, shots: Vec<Shot>, fallback: Shot) -> Self {
            Self::with_options(fps, shots, fallback, Vec::new(), Duration::ZERO)
        }

        fn with_options(
            fps: u32,
            shots: Vec<Shot>,
            fallback: Shot,
            fail_opens: Vec<bool>,
            latency: Duration,
        ) -> Self {
            let clock = Arc::new(ManualClock::new());
            let mock = Arc::new(MockState {
                events: Mutex::new(Vec::new()),
                shots: Mutex::new(shots.into()),
                fallback,
                fail_opens: Mutex::new(fail_opens.into()),
                latency,
                clock: Arc::clone(&clock),
            });
            let slot = Arc::new(LatestFrameSlot::new());
            let config = SupervisorConfig {
                fps,
                ..SupervisorConfig::default()
            };

            let supervisor = CaptureSupervisor::new(
                config,
                CameraSettings::default(),
                Box::new(MockProvider(Arc::clone(&mock))),
                Box::new(TagEncoder),
                Arc::clone(&slot),
                Arc::new(ShutdownSignal::new()),
            )
            .with_clock(clock.clone());

            Self {
                supervisor,
                mock,
                clock,
                slot,
            }
        }

        /// Steps while simulated time is below `limit`.
        fn run_until(&mut self, limit: Duration) -> Vec<Cycle> {
            let mut cycles = Vec::new();
            while self.clock.elapsed() < limit {
                cycles.push(self.supervisor.step());
            }
            cycles
        }
    }

    #[test]
    fn test_transient_failure_keeps_last_frame_without_restart() {
        let mut h = Harness::new(
            1,
            vec![Shot::Frame(1), Shot::Frame(2), Shot::Fail, Shot::Frame(3)],
            Shot::Fail,
        );
        h.supervisor.start().unwrap();

        let cycles = h.run_until(Duration::from_secs(4));

        assert_eq!(cycles.len(), 4);
        assert_eq!(cycles[2].frame, CycleOutcome::CaptureFailed);
        assert!(cycles.iter().all(|c| c.restart.is_none()));
        assert_eq!(h.slot.read().unwrap(), Bytes::from_static(b"jpeg-3"));
        assert_eq!(h.mock.count(Event::Open), 1);
        assert_eq!(h.mock.count(Event::Close), 0);
        assert_eq!(h.supervisor.stats().snapshot().capture_failures, 1);
    }

    #[test]
    fn test_permanent_failure_restarts_once_per_stall() {
        let mut h = Harness::new(1, Vec::new(), Shot::Fail);
        h.supervisor.start().unwrap();

        let cycles = h.run_until(Duration::from_millis(6001));

        let restarts: Vec<_> = cycles.iter().filter_map(|c| c.restart).collect();
        assert_eq!(restarts, vec![RestartOutcome::Reopened]);
        assert_eq!(h.mock.count(Event::Close), 1);
        assert_eq!(h.mock.count(Event::Open), 2);
        assert!(h.slot.read().is_none());

        let stats = h.supervisor.stats().snapshot();
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.failed_restarts, 0);
        assert_eq!(stats.state, SupervisorState::Running);
    }

    #[test]
    fn test_no_capture_during_restart() {
        let mut h = Harness::new(2, Vec::new(), Shot::Fail);
        h.supervisor.start().unwrap();
        h.run_until(Duration::from_secs(20));

        let events = h.mock.events.lock().clone();
        let mut restarting = false;
        for event in &events {
            match event {
                Event::Stop => restarting = true,
                Event::Start => restarting = false,
                Event::Capture => assert!(!restarting, "capture during restart: {events:?}"),
                _ => {}
            }
        }
        assert!(h.mock.count(Event::Close) >= 2);
    }

    #[test]
    fn test_failed_restart_backs_off_and_resets_window() {
        let mut h = Harness::with_options(
            1,
            Vec::new(),
            Shot::Fail,
            vec![false, true],
            Duration::ZERO,
        );
        h.supervisor.start().unwrap();

        // Stall detected at t=6; settle 0.5s + backoff 2s puts the reset at 8.5s,
        // so the next stall cannot be detected before 13.5s.
        let cycles = h.run_until(Duration::from_secs(14));
        let restarts: Vec<_> = cycles.iter().filter_map(|c| c.restart).collect();
        assert_eq!(restarts, vec![RestartOutcome::Failed]);

        let stats = h.supervisor.stats().snapshot();
        assert_eq!(stats.failed_restarts, 1);
        assert_eq!(stats.state, SupervisorState::Running);

        // Camera is gone until the next restart; captures fail without a device
        assert_eq!(h.mock.count(Event::Capture), 7);

        let cycle = h.supervisor.step();
        assert_eq!(cycle.restart, Some(RestartOutcome::Reopened));
        assert_eq!(h.supervisor.stats().snapshot().restarts, 2);
    }

    #[test]
    fn test_pacing_caps_cycle_rate() {
        let mut h = Harness::new(5, Vec::new(), Shot::Frame(9));
        h.supervisor.start().unwrap();

        for _ in 0..25 {
            h.supervisor.step();
        }

        let published = h.supervisor.stats().snapshot().frames_published;
        assert_eq!(published, 25);
        let mean = h.clock.elapsed() / published as u32;
        assert!(mean >= Duration::from_millis(200), "mean interval {mean:?}");
        assert_eq!(h.slot.sequence(), 25);
    }

    #[test]
    fn test_slow_capture_runs_back_to_back() {
        let mut h = Harness::with_options(
            5,
            Vec::new(),
            Shot::Frame(1),
            Vec::new(),
            Duration::from_millis(300),
        );
        h.supervisor.start().unwrap();

        for _ in 0..10 {
            h.supervisor.step();
        }

        assert_eq!(h.clock.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn test_encode_failure_skips_publish() {
        let mut h = Harness::new(5, vec![Shot::Corrupt], Shot::Frame(4));
        h.supervisor.start().unwrap();

        assert_eq!(h.supervisor.step().frame, CycleOutcome::EncodeFailed);
        assert!(h.slot.read().is_none());
        assert_eq!(
            h.supervisor.step().frame,
            CycleOutcome::Published { sequence: 1 }
        );
        assert_eq!(h.supervisor.stats().snapshot().encode_failures, 1);
    }

    #[test]
    fn test_startup_retries_then_succeeds() {
        let mut h = Harness::with_options(
            5,
            Vec::new(),
            Shot::Frame(1),
            vec![true, true],
            Duration::ZERO,
        );

        h.supervisor.start().unwrap();
        assert_eq!(h.mock.count(Event::Open), 3);
        assert_eq!(h.clock.elapsed(), Duration::from_secs(4));
        assert_eq!(h.supervisor.state(), SupervisorState::Running);
    }

    #[test]
    fn test_startup_failure_is_fatal() {
        let mut h = Harness::with_options(
            5,
            Vec::new(),
            Shot::Frame(1),
            vec![true, true, true],
            Duration::ZERO,
        );

        let err = h.supervisor.start().unwrap_err();
        assert!(matches!(err, SupervisorError::Startup { attempts: 3, .. }));
        assert_eq!(h.supervisor.state(), SupervisorState::Uninitialized);
    }

    #[test]
    fn test_run_exits_on_shutdown() {
        let mock = Arc::new(MockState {
            events: Mutex::new(Vec::new()),
            shots: Mutex::new(VecDeque::new()),
            fallback: Shot::Frame(5),
            fail_opens: Mutex::new(VecDeque::new()),
            latency: Duration::ZERO,
            clock: Arc::new(ManualClock::new()),
        });
        let slot = Arc::new(LatestFrameSlot::new());
        let shutdown = Arc::new(ShutdownSignal::new());
        let config = SupervisorConfig {
            fps: 50,
            ..SupervisorConfig::default()
        };

        let supervisor = CaptureSupervisor::new(
            config,
            CameraSettings::default(),
            Box::new(MockProvider(Arc::clone(&mock))),
            Box::new(TagEncoder),
            Arc::clone(&slot),
            Arc::clone(&shutdown),
        );
        let stats = supervisor.stats();
        let handle = supervisor.spawn().unwrap();

        thread::sleep(Duration::from_millis(150));
        shutdown.trigger();
        handle.join().unwrap().unwrap();

        assert_eq!(slot.read().unwrap(), Bytes::from_static(b"jpeg-5"));
        assert_eq!(mock.events.lock().last(), Some(&Event::Close));
        assert_eq!(stats.state(), SupervisorState::Stopped);
    }
}
