//! Raw frame → JPEG encoding

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::ExtendedColorType;
use thiserror::Error;

use crate::camera::{PixelFormat, RawFrame};

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("frame size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("JPEG encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Turns a raw frame into a compressed image.
///
/// Implementations must be pure with respect to the frame: the same input
/// always yields an equivalent output and no state is shared between calls.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &RawFrame, quality: u8) -> Result<Bytes, EncodeError>;
}

/// Baseline JPEG encoder built on the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegEncoder;

impl FrameEncoder for JpegEncoder {
    fn encode(&self, frame: &RawFrame, quality: u8) -> Result<Bytes, EncodeError> {
        let expected = frame.expected_len();
        if frame.data.len() != expected {
            return Err(EncodeError::SizeMismatch {
                expected,
                actual: frame.data.len(),
            });
        }

        let swapped;
        let rgb: &[u8] = match frame.format {
            PixelFormat::Rgb888 => &frame.data,
            PixelFormat::Bgr888 => {
                swapped = bgr_to_rgb(&frame.data);
                &swapped
            }
        };

        // The underlying encoder rejects quality 0
        let quality = quality.clamp(1, 100);

        let mut jpeg = Vec::with_capacity(expected / 8);
        let mut encoder = ImageJpegEncoder::new_with_quality(&mut jpeg, quality);
        encoder.encode(rgb, frame.width, frame.height, ExtendedColorType::Rgb8)?;

        Ok(Bytes::from(jpeg))
    }
}

fn bgr_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for px in data.chunks_exact(3) {
        out.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    out
}
