//! Local image-sequence source.
//!
//! Reads a directory of JPEG/PNG files in lexical order, one frame per file.
//! Reaching the last file is end-of-stream, not an error. The source is local
//! only; paths with URL schemes are rejected.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use image::imageops::FilterType;

use super::registry::SourceSpec;
use super::{cancellable_sleep, FrameProducer};
use crate::error::VisionError;
use crate::frame::{Frame, FrameImage};
use crate::now_s;

pub struct ImageDirSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    resize: Option<(u32, u32)>,
    target_fps: u32,
    last_frame_at: Option<Instant>,
    released: bool,
    cancel: Arc<AtomicBool>,
}

impl ImageDirSource {
    pub fn open(spec: &SourceSpec) -> Result<Self> {
        if spec.uri.trim().is_empty() || spec.uri.contains("://") {
            return Err(VisionError::config(format!(
                "image sources only support local directories, got '{}'",
                spec.uri
            ))
            .into());
        }
        let dir = PathBuf::from(&spec.uri);
        let files = list_images(&dir)?;
        if files.is_empty() {
            return Err(VisionError::acquisition(format!(
                "no .jpg/.jpeg/.png files in {}",
                dir.display()
            ))
            .into());
        }
        let resize = match (spec.width, spec.height) {
            (Some(w), Some(h)) => Some((w, h)),
            _ => None,
        };
        log::info!(
            "ImageDirSource: {} frames in {}",
            files.len(),
            dir.display()
        );
        Ok(Self {
            dir,
            files,
            cursor: 0,
            resize,
            target_fps: spec.target_fps,
            last_frame_at: None,
            released: false,
            cancel: Arc::new(AtomicBool::new(false)),
        })
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
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        VisionError::acquisition(format!("failed to open {}: {}", dir.display(), e))
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
            .unwrap_or(false);
        if is_image {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

impl FrameProducer for ImageDirSource {
    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.released {
            return Err(
                VisionError::acquisition(format!("{} already released", self.dir.display())).into(),
            );
        }
        let Some(path) = self.files.get(self.cursor).cloned() else {
            return Ok(None);
        };
        self.pace();
        let decoded = image::open(&path)
            .with_context(|| format!("decode {}", path.display()))?
            .to_rgb8();
        let pixels = match self.resize {
            Some((w, h)) if decoded.width() != w || decoded.height() != h => {
                image::imageops::resize(&decoded, w, h, FilterType::Triangle)
            }
            _ => decoded,
        };
        let frame = Frame::new(self.cursor as u64, now_s(), FrameImage::from_rgb(pixels));
        self.cursor += 1;
        Ok(Some(frame))
    }

    fn release(&mut self) {
        if !self.released {
            log::info!(
                "ImageDirSource: released {} at frame {}/{}",
                self.dir.display(),
                self.cursor,
                self.files.len()
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
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    #[test]
    fn reads_images_in_order_then_ends() -> Result<()> {
        let dir = tempdir()?;
        for (i, name) in ["b.png", "a.png", "notes.txt"].iter().enumerate() {
            let path = dir.path().join(name);
            if name.ends_with(".png") {
                RgbImage::from_pixel(4, 3, Rgb([i as u8, 0, 0])).save(&path)?;
            } else {
                std::fs::write(&path, "skip me")?;
            }
        }
        let spec = SourceSpec::new(dir.path().to_string_lossy(), "images");
        let mut source = ImageDirSource::open(&spec)?;

        let first = source.next_frame()?.expect("first frame");
        assert_eq!(first.id, 0);
        // a.png was written second (red = 1) but sorts first.
        assert_eq!(first.image.as_rgb().get_pixel(0, 0).0, [1, 0, 0]);
        assert_eq!(source.next_frame()?.map(|f| f.id), Some(1));
        assert!(source.next_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn missing_directory_is_a_source_error() {
        let spec = SourceSpec::new("/definitely/not/here", "images");
        let err = match ImageDirSource::open(&spec) {
            Ok(_) => panic!("directory does not exist"),
            Err(err) => err,
        };
        assert!(matches!(
            crate::error::classify(&err),
            Some(VisionError::Source(_))
        ));
    }
}
