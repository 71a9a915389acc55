//! Synthetic frame source (`stub://`).
//!
//! Produces frames with a moving gradient so encoders and annotators have
//! something to work on. URI query parameters:
//! - `frames=N`: end-of-stream after N frames (default: unbounded)
//! - `fps=N`: pacing override

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use super::registry::SourceSpec;
use super::{cancellable_sleep, FrameProducer};
use crate::error::VisionError;
use crate::frame::{Frame, FrameImage};
use crate::now_s;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;

pub struct SyntheticSource {
    uri: String,
    width: u32,
    height: u32,
    target_fps: u32,
    max_frames: Option<u64>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    released: bool,
    cancel: Arc<AtomicBool>,
}

impl SyntheticSource {
    pub fn new(uri: &str, width: u32, height: u32, target_fps: u32, max_frames: Option<u64>) -> Self {
        Self {
            uri: uri.to_string(),
            width,
            height,
            target_fps,
            max_frames,
            frame_count: 0,
            last_frame_at: None,
            released: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_spec(spec: &SourceSpec) -> Result<Self> {
        let mut max_frames = None;
        let mut target_fps = spec.target_fps;
        if let Some(query) = spec.uri.split('?').nth(1) {
            for pair in query.split('&') {
                let Some((key, value)) = pair.split_once('=') else {
                    continue;
                };
                match key {
                    "frames" => {
                        max_frames = Some(value.parse::<u64>().map_err(|_| {
                            VisionError::config(format!("invalid frames={} in {}", value, spec.uri))
                        })?)
                    }
                    "fps" => {
                        target_fps = value.parse::<u32>().map_err(|_| {
                            VisionError::config(format!("invalid fps={} in {}", value, spec.uri))
                        })?
                    }
                    _ => {}
                }
            }
        }
        Ok(Self::new(
            &spec.uri,
            spec.width.unwrap_or(DEFAULT_WIDTH),
            spec.height.unwrap_or(DEFAULT_HEIGHT),
            target_fps,
            max_frames,
        ))
    }

    fn pace(&mut self) {
        if self.target_fps == 0 {
            return;
        }
        let budget = Duration::from_secs_f64(1.0 / self.target_fps as f64);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < budget {
                cancellable_sleep(budget - elapsed, &self.cancel);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let row_bytes = self.width as usize * 3;
        let mut pixels = vec![0u8; row_bytes * self.height as usize];
        let shift = self.frame_count as usize;
        for (row, chunk) in pixels.chunks_mut(row_bytes).enumerate() {
            let shade = ((row + shift) % 256) as u8;
            for px in chunk.chunks_mut(3) {
                px[0] = shade;
                px[1] = shade / 2;
                px[2] = 64;
            }
        }
        pixels
    }
}

impl FrameProducer for SyntheticSource {
    fn describe(&self) -> String {
        self.uri.clone()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.released {
            return Err(VisionError::acquisition(format!("{} already released", self.uri)).into());
        }
        if self.max_frames.is_some_and(|max| self.frame_count >= max) {
            return Ok(None);
        }
        self.pace();
        let image = FrameImage::from_raw(self.width, self.height, self.generate_pixels())?;
        let frame = Frame::new(self.frame_count, now_s(), image);
        self.frame_count += 1;
        Ok(Some(frame))
    }

    fn release(&mut self) {
        if !self.released {
            log::info!(
                "SyntheticSource: released {} after {} frames",
                self.uri,
                self.frame_count
            );
        }
        self.released = true;
    }

    fn cancel_token(&self) -> Option<Arc<AtomicBool>> {
        Some(self.cancel.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finite_stub_ends_and_ids_increase() -> Result<()> {
        let spec = SourceSpec {
            width: Some(8),
            height: Some(4),
            ..SourceSpec::new("stub://test?frames=3", "synthetic")
        };
        let mut source = SyntheticSource::from_spec(&spec)?;
        let mut ids = Vec::new();
        while let Some(frame) = source.next_frame()? {
            assert_eq!(frame.image.width(), 8);
            ids.push(frame.id);
        }
        assert_eq!(ids, vec![0, 1, 2]);
        source.release();
        assert!(source.next_frame().is_err());
        Ok(())
    }

    #[test]
    fn rejects_malformed_query() {
        let spec = SourceSpec::new("stub://test?frames=many", "synthetic");
        assert!(SyntheticSource::from_spec(&spec).is_err());
    }
}
