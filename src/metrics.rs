//! Per-camera pipeline counters and latency windows.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

const ROLLING_SAMPLES: usize = 1000;

#[derive(Debug)]
struct RollingWindow {
    samples: VecDeque<f64>,
}

impl RollingWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(ROLLING_SAMPLES),
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == ROLLING_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }

    fn max(&self) -> f64 {
        self.samples.iter().copied().fold(0.0, f64::max)
    }
}

#[derive(Debug)]
pub struct PipelineMetrics {
    captured: AtomicU64,
    processed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    reused: AtomicU64,
    delivered: AtomicU64,
    detection_ms: Mutex<RollingWindow>,
    tracking_ms: Mutex<RollingWindow>,
    started: Instant,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_captured: u64,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub frames_failed: u64,
    pub analyses_reused: u64,
    pub frames_delivered: u64,
    pub avg_detection_ms: f64,
    pub max_detection_ms: f64,
    pub avg_tracking_ms: f64,
    pub effective_fps: f64,
    pub uptime_secs: f64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            captured: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            detection_ms: Mutex::new(RollingWindow::new()),
            tracking_ms: Mutex::new(RollingWindow::new()),
            started: Instant::now(),
        }
    }

    pub fn record_captured(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the running total, used to rate-limit congestion warnings.
    pub fn record_skipped(&self) -> u64 {
        self.skipped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reused(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_detection(&self, elapsed: Duration) {
        if let Ok(mut window) = self.detection_ms.lock() {
            window.push(elapsed.as_secs_f64() * 1000.0);
        }
    }

    pub fn record_tracking(&self, elapsed: Duration) {
        if let Ok(mut window) = self.tracking_ms.lock() {
            window.push(elapsed.as_secs_f64() * 1000.0);
        }
    }

    pub fn frames_delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (avg_detection_ms, max_detection_ms) = self
            .detection_ms
            .lock()
            .map(|w| (w.mean(), w.max()))
            .unwrap_or((0.0, 0.0));
        let avg_tracking_ms = self.tracking_ms.lock().map(|w| w.mean()).unwrap_or(0.0);
        let uptime_secs = self.started.elapsed().as_secs_f64();
        let processed = self.processed.load(Ordering::Relaxed);
        MetricsSnapshot {
            frames_captured: self.captured.load(Ordering::Relaxed),
            frames_processed: processed,
            frames_skipped: self.skipped.load(Ordering::Relaxed),
            frames_failed: self.failed.load(Ordering::Relaxed),
            analyses_reused: self.reused.load(Ordering::Relaxed),
            frames_delivered: self.delivered.load(Ordering::Relaxed),
            avg_detection_ms,
            max_detection_ms,
            avg_tracking_ms,
            effective_fps: if uptime_secs > 0.0 {
                processed as f64 / uptime_secs
            } else {
                0.0
            },
            uptime_secs,
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
