//! In-memory frame list, used by the replay binary and by tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::FrameProducer;
use crate::error::VisionError;
use crate::frame::Frame;

pub struct VecSource {
    frames: VecDeque<Frame>,
    delay: Option<Duration>,
    fail_after: Option<usize>,
    delivered: usize,
    release_count: Arc<AtomicUsize>,
    cancel: Arc<AtomicBool>,
}

impl VecSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into(),
            delay: None,
            fail_after: None,
            delivered: 0,
            release_count: Arc::new(AtomicUsize::new(0)),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sleep before each frame, imitating a device's frame interval.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Return a source error instead of the frame after `n` deliveries.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Counter incremented by every `release` call.
    pub fn release_counter(&self) -> Arc<AtomicUsize> {
        self.release_count.clone()
    }
}

impl FrameProducer for VecSource {
    fn describe(&self) -> String {
        "memory://frames".to_string()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.fail_after.is_some_and(|n| self.delivered >= n) {
            return Err(VisionError::acquisition("device disconnected").into());
        }
        if let Some(delay) = self.delay {
            super::cancellable_sleep(delay, &self.cancel);
        }
        let frame = self.frames.pop_front();
        if frame.is_some() {
            self.delivered += 1;
        }
        Ok(frame)
    }

    fn release(&mut self) {
        self.release_count.fetch_add(1, Ordering::SeqCst);
        self.frames.clear();
    }

    fn cancel_token(&self) -> Option<Arc<AtomicBool>> {
        Some(self.cancel.clone())
    }
}
