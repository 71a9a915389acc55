//! Traffic Vision
//!
//! Multi-camera traffic analysis: frames are pulled from a source, vehicles
//! are detected, tracked and counted per zone, and per-zone statistics are
//! aggregated over fixed windows and persisted.
//!
//! # Architecture
//!
//! Each camera runs an independent [`pipeline::FramePipeline`]: a capture
//! worker and a processing worker connected by bounded queues, with catch-up
//! skipping when processing falls behind. The processing worker drives a
//! [`processor::ProcessorChain`]:
//!
//! 1. **Detection** (`detect`): raw vehicle boxes from a pluggable backend.
//! 2. **Tracking** (`tracking`): stable ids and majority-vote class labels.
//! 3. **Speed** (`speed`): km/h from bottom-center motion over a 1 s window.
//! 4. **Zones** (`zones`): per-zone counts, speed and occupancy every frame.
//! 5. **Aggregation** (`aggregate`): windowed reduction into `TrafficData`
//!    handed to a `storage::TrafficRepository`.
//!
//! The [`camera::CameraOrchestrator`] owns all cameras, caches their latest
//! frames and publishes throttled analysis messages through a
//! [`broadcast::Broadcaster`]. `api` exposes status, control and streams over
//! HTTP.
//!
//! # Module Structure
//!
//! - `frame`, `model`: frames and the analysis data model
//! - `ingest`: frame sources and the source registry
//! - `detect`: detector trait, backends and registry
//! - `error`: the `VisionError` taxonomy
//! - `config`: file and environment configuration

use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};

pub mod aggregate;
pub mod annotate;
pub mod api;
pub mod broadcast;
pub mod camera;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod processor;
pub mod speed;
pub mod storage;
pub mod tracking;
pub mod zones;

pub use camera::{CameraBuilder, CameraOrchestrator, CameraStatus};
pub use config::{AppConfig, CameraSettings};
pub use error::VisionError;
pub use frame::{Frame, FrameImage};
pub use model::{
    AnalysisMessage, BBox, DetectedVehicle, FrameAnalysis, TrafficData, VehicleType,
    ZoneVehicleCount,
};
pub use pipeline::{FramePipeline, PipelineConfig};

/// Wall-clock seconds since the Unix epoch.
pub fn now_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Join `handle`, giving up after `timeout`. The thread keeps running if abandoned.
pub(crate) fn join_bounded(handle: JoinHandle<()>, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(anyhow!("join timed out after {:?}", timeout));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    handle
        .join()
        .map_err(|_| anyhow!("worker thread panicked"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_bounded_gives_up_on_stuck_threads() {
        let stuck = std::thread::spawn(|| std::thread::sleep(Duration::from_millis(300)));
        assert!(join_bounded(stuck, Duration::from_millis(20)).is_err());
        let quick = std::thread::spawn(|| {});
        assert!(join_bounded(quick, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn join_bounded_reports_panics() {
        let panicking = std::thread::spawn(|| panic!("boom"));
        assert!(join_bounded(panicking, Duration::from_secs(1)).is_err());
    }
}
