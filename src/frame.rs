//! Captured frames.
//!
//! - `Frame`: one captured image plus its per-source sequence id and capture time.
//! - `FrameImage`: opaque RGB8 pixel buffer.
//!
//! Frames move from the capture worker to the processing worker to the consumer.
//! Neither type implements `Clone`; the only copy path is `FrameImage::snapshot`,
//! used when the orchestrator refreshes its latest-frame cache.

use anyhow::{anyhow, Result};
use image::RgbImage;

/// Opaque pixel buffer (RGB, 8 bits per channel).
///
/// Explicitly NOT implementing `Clone`: a frame is owned by exactly one
/// pipeline stage at a time.
pub struct FrameImage {
    pixels: RgbImage,
}

impl FrameImage {
    pub fn from_rgb(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    /// Wraps a raw RGB8 byte buffer. Fails when the length does not match.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} rgb",
                data.len(),
                expected,
                width,
                height
            ));
        }
        let pixels = RgbImage::from_raw(width, height, data)
            .ok_or_else(|| anyhow!("frame buffer rejected for {}x{}", width, height))?;
        Ok(Self { pixels })
    }

    /// Black image, used by sources and tests that carry no real pixels.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            pixels: RgbImage::new(width, height),
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Read-only view for detectors and encoders.
    pub fn as_rgb(&self) -> &RgbImage {
        &self.pixels
    }

    /// Explicit deep copy for the latest-frame cache.
    pub fn snapshot(&self) -> RgbImage {
        self.pixels.clone()
    }

    pub fn into_rgb(self) -> RgbImage {
        self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.as_raw().len()
    }
}

/// One captured image with its sequence id and capture timestamp (seconds since epoch).
pub struct Frame {
    pub id: u64,
    pub timestamp: f64,
    pub image: FrameImage,
}

impl Frame {
    pub fn new(id: u64, timestamp: f64, image: FrameImage) -> Self {
        Self {
            id,
            timestamp,
            image,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_checks_length() {
        assert!(FrameImage::from_raw(4, 2, vec![0u8; 24]).is_ok());
        assert!(FrameImage::from_raw(4, 2, vec![0u8; 23]).is_err());
    }

    #[test]
    fn snapshot_is_independent_copy() {
        let image = FrameImage::blank(8, 8);
        let mut copy = image.snapshot();
        copy.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        assert_eq!(image.as_rgb().get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(image.byte_len(), 8 * 8 * 3);
    }
}
