//! Synthetic camera producing scrolling colour bars.
//!
//! Used with `--test-pattern` on machines without camera hardware, the same
//! way `videotestsrc` stands in for `libcamerasrc` in the GStreamer pipelines.

use tracing::debug;

use super::{CameraDevice, CameraError, CameraProvider, CameraSettings, PixelFormat, RawFrame};

/// SMPTE-ish bar colours in RGB order.
const BARS: [[u8; 3]; 8] = [
    [192, 192, 192],
    [192, 192, 0],
    [0, 192, 192],
    [0, 192, 0],
    [192, 0, 192],
    [192, 0, 0],
    [0, 0, 192],
    [16, 16, 16],
];

#[derive(Debug, Default)]
pub struct TestPatternProvider;

impl CameraProvider for TestPatternProvider {
    fn open(&self, _settings: &CameraSettings) -> Result<Box<dyn CameraDevice>, CameraError> {
        Ok(Box::new(TestPatternCamera::default()))
    }

    fn name(&self) -> &str {
        "test-pattern"
    }
}

#[derive(Debug, Default)]
pub struct TestPatternCamera {
    settings: Option<CameraSettings>,
    running: bool,
    frame_index: u64,
}

impl TestPatternCamera {
    fn render(&self, settings: &CameraSettings) -> Vec<u8> {
        let width = settings.width as usize;
        let height = settings.height as usize;
        let bar_width = (width / BARS.len()).max(1);
        let shift = (self.frame_index as usize * 4) % width.max(1);
        let offset = (settings.brightness.clamp(-1.0, 1.0) * 255.0) as i32;

        let mut row = Vec::with_capacity(width * 3);
        for x in 0..width {
            let bar = ((x + shift) / bar_width) % BARS.len();
            let [r, g, b] = BARS[bar].map(|c| (c as i32 + offset).clamp(0, 255) as u8);
            match settings.format {
                PixelFormat::Rgb888 => row.extend_from_slice(&[r, g, b]),
                PixelFormat::Bgr888 => row.extend_from_slice(&[b, g, r]),
            }
        }

        row.repeat(height)
    }
}

impl CameraDevice for TestPatternCamera {
    fn configure(&mut self, settings: &CameraSettings) -> Result<(), CameraError> {
        if settings.width == 0 || settings.height == 0 {
            return Err(CameraError::Unsupported("zero-sized frame".to_string()));
        }
        self.settings = Some(settings.clone());
        Ok(())
    }

    fn start(&mut self) -> Result<(), CameraError> {
        if self.settings.is_none() {
            return Err(CameraError::NotStarted);
        }
        self.running = true;
        debug!("Test pattern camera started");
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<RawFrame, CameraError> {
        if !self.running {
            return Err(CameraError::NotStarted);
        }
        let settings = self.settings.as_ref().ok_or(CameraError::Closed)?;
        let frame = RawFrame {
            width: settings.width,
            height: settings.height,
            format: settings.format,
            data: self.render(settings),
        };
        self.frame_index += 1;
        Ok(frame)
    }

    fn stop(&mut self) -> Result<(), CameraError> {
        self.running = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), CameraError> {
        self.running = false;
        self.settings = None;
        Ok(())
    }
}
