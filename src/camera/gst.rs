//! GStreamer-backed camera driver
//!
//! Raw frames are pulled synchronously from an `appsink` at the end of a
//! platform-specific pipeline (`libcamerasrc` on the Pi, `v4l2src` on generic
//! Linux, `avfvideosrc` on macOS).

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, info};

use super::platform::{flip_element, PlatformInfo};
use super::{CameraDevice, CameraError, CameraProvider, CameraSettings, RawFrame};

impl From<gst::glib::Error> for CameraError {
    fn from(e: gst::glib::Error) -> Self {
        CameraError::Pipeline(e.to_string())
    }
}

impl From<gst::glib::BoolError> for CameraError {
    fn from(e: gst::glib::BoolError) -> Self {
        CameraError::Pipeline(e.to_string())
    }
}

/// Opens [`GstCamera`] sessions for the detected platform.
pub struct GstCameraProvider {
    platform: PlatformInfo,
}

impl GstCameraProvider {
    pub fn new() -> Result<Self, CameraError> {
        gst::init()?;
        let platform = PlatformInfo::detect();
        info!(platform = ?platform, "GStreamer camera provider ready");
        Ok(Self { platform })
    }
}

impl CameraProvider for GstCameraProvider {
    fn open(&self, settings: &CameraSettings) -> Result<Box<dyn CameraDevice>, CameraError> {
        Ok(Box::new(GstCamera::new(self.platform, settings.capture_timeout_ms)))
    }

    fn name(&self) -> &str {
        "gstreamer"
    }
}

/// One camera session backed by a GStreamer pipeline.
pub struct GstCamera {
    platform: PlatformInfo,
    timeout_ms: u64,
    pipeline: Option<gst::Pipeline>,
    appsink: Option<gst_app::AppSink>,
    settings: Option<CameraSettings>,
    playing: bool,
}

impl GstCamera {
    fn new(platform: PlatformInfo, timeout_ms: u64) -> Self {
        Self {
            platform,
            timeout_ms,
            pipeline: None,
            appsink: None,
            settings: None,
            playing: false,
        }
    }

    fn build_pipeline_string(&self, settings: &CameraSettings) -> String {
        let mut pipeline = self.platform.source_element(settings.device.as_deref());

        pipeline.push_str(&format!(
            " ! videoconvert ! videobalance brightness={:.3}",
            settings.brightness
        ));

        if let Some(flip) = settings.flip_method.as_deref().and_then(flip_element) {
            pipeline.push_str(" ! ");
            pipeline.push_str(flip);
        }

        pipeline.push_str(&format!(
            " ! videoscale ! videorate ! video/x-raw,format={},width={},height={},framerate={}/1 \
             ! appsink name=sink max-buffers=2 drop=true sync=false",
            settings.format.gst_name(),
            settings.width,
            settings.height,
            settings.fps
        ));

        pipeline
    }
}

impl CameraDevice for GstCamera {
    fn configure(&mut self, settings: &CameraSettings) -> Result<(), CameraError> {
        let description = self.build_pipeline_string(settings);
        debug!(pipeline = %description, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&description)?
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| CameraError::Pipeline("Not a pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| CameraError::Pipeline("No appsink found".to_string()))?
            .dynamic_cast::<gst_app::AppSink>()
            .map_err(|_| CameraError::Pipeline("Not an appsink".to_string()))?;

        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        self.settings = Some(settings.clone());
        Ok(())
    }

    fn start(&mut self) -> Result<(), CameraError> {
        let pipeline = self.pipeline.as_ref().ok_or(CameraError::NotStarted)?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| CameraError::StateChange(format!("{:?}", e)))?;
        self.playing = true;
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<RawFrame, CameraError> {
        if !self.playing {
            return Err(CameraError::NotStarted);
        }
        let (appsink, settings) = match (&self.appsink, &self.settings) {
            (Some(sink), Some(settings)) => (sink, settings),
            _ => return Err(CameraError::Closed),
        };

        let sample = appsink
            .try_pull_sample(gst::ClockTime::from_mseconds(self.timeout_ms))
            .ok_or(CameraError::Timeout(self.timeout_ms))?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| CameraError::Driver("Sample had no buffer".to_string()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| CameraError::Driver("Unable to map buffer".to_string()))?;

        let data = strip_row_padding(map.as_slice(), settings)?;
        Ok(RawFrame {
            width: settings.width,
            height: settings.height,
            format: settings.format,
            data,
        })
    }

    fn stop(&mut self) -> Result<(), CameraError> {
        if !self.playing {
            return Ok(());
        }
        self.playing = false;
        if let Some(pipeline) = &self.pipeline {
            pipeline
                .set_state(gst::State::Null)
                .map_err(|e| CameraError::StateChange(format!("{:?}", e)))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), CameraError> {
        self.appsink = None;
        self.settings = None;
        if let Some(pipeline) = self.pipeline.take() {
            pipeline
                .set_state(gst::State::Null)
                .map_err(|e| CameraError::StateChange(format!("{:?}", e)))?;
        }
        Ok(())
    }
}

impl Drop for GstCamera {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}

/// GStreamer aligns raw RGB rows to 4 bytes; repack into a tight buffer.
fn strip_row_padding(data: &[u8], settings: &CameraSettings) -> Result<Vec<u8>, CameraError> {
    let row = settings.width as usize * settings.format.bytes_per_pixel();
    let height = settings.height as usize;
    let stride = (row + 3) & !3;

    if data.len() == row * height {
        return Ok(data.to_vec());
    }
    if data.len() < stride * height {
        return Err(CameraError::Driver(format!(
            "short frame: {} bytes for {}x{}",
            data.len(),
            settings.width,
            settings.height
        )));
    }

    let mut packed = Vec::with_capacity(row * height);
    for line in data.chunks(stride).take(height) {
        packed.extend_from_slice(&line[..row]);
    }
    Ok(packed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_string_linux() {
        let camera = GstCamera::new(PlatformInfo::Linux, 1000);
        let settings = CameraSettings {
            device: Some("/dev/video1".to_string()),
            flip_method: Some("rotate-180".to_string()),
            ..CameraSettings::default()
        };
        let desc = camera.build_pipeline_string(&settings);
        assert!(desc.starts_with("v4l2src device=/dev/video1"));
        assert!(desc.contains("videobalance brightness=0.100"));
        assert!(desc.contains("videoflip video-direction=2"));
        assert!(desc.contains("format=RGB,width=480,height=360,framerate=5/1"));
    }

    #[test]
    fn test_strip_row_padding() {
        let settings = CameraSettings {
            width: 1,
            height: 2,
            ..CameraSettings::default()
        };
        let padded = [1, 2, 3, 0, 4, 5, 6, 0];
        assert_eq!(strip_row_padding(&padded, &settings).unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert!(strip_row_padding(&[1, 2], &settings).is_err());
    }
}
