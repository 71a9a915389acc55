//! Frame ingestion sources.
//!
//! This module provides the sources a camera pipeline can pull frames from:
//! - Synthetic streams (`stub://`), live-like and paced, for demos and tests
//! - Local image sequences (a directory of JPEG/PNG files), ending at end-of-stream
//! - In-memory frame lists (`VecSource`)
//! - `ReconnectingSource`, which wraps network-style inputs with bounded backoff
//!
//! Every source yields frames in strictly increasing `id` order and must be
//! released exactly once. Sources are opened through a `SourceRegistry` value
//! built at startup and passed to whatever needs it.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;

use crate::frame::Frame;

pub mod image_dir;
pub mod memory;
pub mod reconnect;
mod registry;
pub mod synthetic;

pub use image_dir::ImageDirSource;
pub use memory::VecSource;
pub use reconnect::{ReconnectPolicy, ReconnectingSource};
pub use registry::{SourceFactory, SourceRegistry, SourceSpec};
pub use synthetic::SyntheticSource;

/// Ordered frame stream consumed by the capture worker.
pub trait FrameProducer: Send {
    /// Human-readable description (URI or path) for status output.
    fn describe(&self) -> String;

    /// Next frame, `Ok(None)` at end-of-stream. Errors are `VisionError::Source`
    /// when the source cannot continue.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Release the underlying device/file/stream. Called exactly once.
    fn release(&mut self);

    /// Flag the pipeline raises on stop so that blocking waits inside the
    /// source (reconnect backoff, pacing) can return early.
    fn cancel_token(&self) -> Option<Arc<AtomicBool>> {
        None
    }
}

/// Sleeps for `total`, returning early once `cancel` is raised.
pub(crate) fn cancellable_sleep(total: std::time::Duration, cancel: &AtomicBool) -> bool {
    let step = std::time::Duration::from_millis(20);
    let deadline = std::time::Instant::now() + total;
    loop {
        if cancel.load(std::sync::atomic::Ordering::SeqCst) {
            return false;
        }
        let now = std::time::Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(step.min(deadline - now));
    }
}
