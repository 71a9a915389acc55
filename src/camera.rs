//! Multi-camera orchestration.
//!
//! Each camera owns an independent [`FramePipeline`] plus its zones and latest
//! frame slots. A supervisor thread per running camera drains the pipeline,
//! refreshes the raw and annotated frame on every iteration and publishes an
//! [`AnalysisMessage`] to the broadcaster at most once per broadcast interval.
//! Failures stay inside the camera: a dead pipeline flips `running` to false
//! and leaves its error in the status.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use serde::Serialize;

use crate::aggregate::TrafficAggregator;
use crate::annotate::annotate;
use crate::broadcast::Broadcaster;
use crate::config::{CameraSettings, PersistenceSettings};
use crate::detect::{DetectorRegistry, DetectorSettings};
use crate::error::VisionError;
use crate::ingest::SourceRegistry;
use crate::join_bounded;
use crate::metrics::MetricsSnapshot;
use crate::model::AnalysisMessage;
use crate::pipeline::FramePipeline;
use crate::processor::ProcessorChain;
use crate::speed::{SpeedEstimator, WindowedSpeedEstimator};
use crate::storage::{open_repository, PersistenceWorker, TrafficRepository};
use crate::tracking::IdentityTracker;
use crate::zones::{SharedZones, ZoneConfig, ZoneCounter};

pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(2);
const SUPERVISOR_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Wires source, detector, processor chain and pipeline for one camera.
pub struct CameraBuilder {
    sources: Arc<SourceRegistry>,
    detectors: Arc<DetectorRegistry>,
    detector_defaults: DetectorSettings,
    persistence_defaults: PersistenceSettings,
}

/// Everything `CameraBuilder::build` produces.
pub struct BuiltCamera {
    pub pipeline: FramePipeline,
    pub zones: SharedZones,
}

impl CameraBuilder {
    pub fn new(sources: Arc<SourceRegistry>, detectors: Arc<DetectorRegistry>) -> Self {
        Self {
            sources,
            detectors,
            detector_defaults: DetectorSettings::default(),
            persistence_defaults: PersistenceSettings::default(),
        }
    }

    pub fn with_detector_defaults(mut self, settings: DetectorSettings) -> Self {
        self.detector_defaults = settings;
        self
    }

    pub fn with_persistence_defaults(mut self, settings: PersistenceSettings) -> Self {
        self.persistence_defaults = settings;
        self
    }

    pub fn build(&self, settings: &CameraSettings) -> Result<BuiltCamera> {
        settings.validate()?;
        let camera_id = settings.camera_id.as_str();

        let zones = ZoneCounter::for_camera(&settings.zones, camera_id)?.into_shared();
        let detector = self
            .detectors
            .create(settings.detector.as_ref().unwrap_or(&self.detector_defaults))
            .with_context(|| format!("camera {}: detector", camera_id))?;
        let speed: Option<Box<dyn SpeedEstimator>> = settings
            .speed
            .enabled
            .then(|| Box::new(WindowedSpeedEstimator::new(&settings.speed)) as Box<dyn SpeedEstimator>);
        let aggregator = self
            .aggregator_for(settings)
            .with_context(|| format!("camera {}: persistence", camera_id))?;

        let chain = ProcessorChain::standard(
            detector,
            settings.performance.detect_every_n,
            IdentityTracker::new(&settings.tracker),
            speed,
            zones.clone(),
            aggregator,
        );
        let source = self
            .sources
            .open(&settings.source_spec())
            .with_context(|| format!("camera {}: source", camera_id))?;
        let pipeline = FramePipeline::new(
            source,
            chain,
            settings
                .performance
                .pipeline_config(settings.on_detection_error),
        );
        Ok(BuiltCamera { pipeline, zones })
    }

    fn aggregator_for(&self, settings: &CameraSettings) -> Result<Option<TrafficAggregator>> {
        let persistence = settings
            .persistence
            .as_ref()
            .unwrap_or(&self.persistence_defaults);
        if !persistence.enabled {
            return Ok(None);
        }
        persistence.validate()?;
        let repository = open_repository(&persistence.kind, &persistence.path)?;
        let repository: Box<dyn TrafficRepository> = if persistence.background {
            Box::new(PersistenceWorker::spawn(
                repository,
                PersistenceWorker::DEFAULT_CAPACITY,
            )?)
        } else {
            repository
        };
        Ok(Some(TrafficAggregator::new(repository, persistence.window_secs)))
    }
}

#[derive(Default)]
struct LatestFrames {
    raw: Option<Arc<RgbImage>>,
    processed: Option<Arc<RgbImage>>,
}

/// Latest raw and annotated frame, replaced together under one lock.
#[derive(Default)]
struct FrameSlots {
    inner: Mutex<LatestFrames>,
}

impl FrameSlots {
    fn lock(&self) -> MutexGuard<'_, LatestFrames> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn store(&self, raw: Arc<RgbImage>, processed: Arc<RgbImage>) {
        let mut slots = self.lock();
        slots.raw = Some(raw);
        slots.processed = Some(processed);
    }

    fn get(&self, processed: bool) -> Option<Arc<RgbImage>> {
        let slots = self.lock();
        if processed {
            slots.processed.clone()
        } else {
            slots.raw.clone()
        }
    }
}

/// Runtime state of one camera, owned by its orchestrator entry.
pub struct CameraState {
    settings: CameraSettings,
    pipeline: Arc<FramePipeline>,
    zones: SharedZones,
    /// The current pipeline has been handed to a supervisor and cannot be reused.
    consumed: bool,
    running: Arc<AtomicBool>,
    frames: Arc<FrameSlots>,
    last_error: Arc<Mutex<Option<String>>>,
    supervisor: Option<JoinHandle<()>>,
}

impl CameraState {
    fn new(settings: CameraSettings, built: BuiltCamera) -> Self {
        Self {
            settings,
            pipeline: Arc::new(built.pipeline),
            zones: built.zones,
            consumed: false,
            running: Arc::new(AtomicBool::new(false)),
            frames: Arc::new(FrameSlots::default()),
            last_error: Arc::new(Mutex::new(None)),
            supervisor: None,
        }
    }

    fn status(&self) -> CameraStatus {
        let metrics = self.pipeline.metrics();
        CameraStatus {
            running: self.running.load(Ordering::SeqCst),
            source: self.settings.source.clone(),
            zones: self
                .zones
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .zone_ids(),
            frames_delivered: metrics.frames_delivered(),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
            metrics: metrics.snapshot(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CameraStatus {
    pub running: bool,
    pub source: String,
    pub zones: Vec<String>,
    pub frames_delivered: u64,
    pub last_error: Option<String>,
    pub metrics: MetricsSnapshot,
}

pub struct CameraOrchestrator {
    cameras: Mutex<BTreeMap<String, CameraState>>,
    builder: CameraBuilder,
    broadcaster: Arc<Broadcaster<AnalysisMessage>>,
    broadcast_interval: Duration,
}

impl CameraOrchestrator {
    pub fn new(builder: CameraBuilder) -> Self {
        Self {
            cameras: Mutex::new(BTreeMap::new()),
            builder,
            broadcaster: Arc::new(Broadcaster::new()),
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
        }
    }

    pub fn with_broadcast_interval(mut self, interval: Duration) -> Self {
        self.broadcast_interval = interval;
        self
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster<AnalysisMessage>> {
        self.broadcaster.clone()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, CameraState>> {
        self.cameras.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn camera_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Register a camera and build its pipeline. Zones without a `camera_id`
    /// inherit `camera_id`.
    pub fn add_camera(&self, camera_id: &str, mut settings: CameraSettings) -> Result<()> {
        if self.lock().contains_key(camera_id) {
            return Err(VisionError::DuplicateCamera(camera_id.to_string()).into());
        }
        settings.camera_id = camera_id.to_string();
        settings.inject_camera_id();
        let built = self.builder.build(&settings)?;

        let mut cameras = self.lock();
        if cameras.contains_key(camera_id) {
            return Err(VisionError::DuplicateCamera(camera_id.to_string()).into());
        }
        log::info!(
            "camera {} added (source {}, {} zones)",
            camera_id,
            settings.source,
            settings.zones.len()
        );
        cameras.insert(camera_id.to_string(), CameraState::new(settings, built));
        Ok(())
    }

    /// Stop and forget a camera.
    pub fn remove_camera(&self, camera_id: &str) -> Result<()> {
        self.stop_camera(camera_id)?;
        self.lock().remove(camera_id);
        self.broadcaster.forget(camera_id);
        log::info!("camera {} removed", camera_id);
        Ok(())
    }

    /// Start a registered camera. A pipeline that already ran (or was stopped
    /// before it ever ran) is rebuilt from the camera's settings first; the
    /// build happens outside the orchestrator lock.
    pub fn start_camera(&self, camera_id: &str) -> Result<()> {
        let mut replacement: Option<(CameraSettings, BuiltCamera)> = None;
        loop {
            let settings = {
                let mut cameras = self.lock();
                let state = cameras
                    .get_mut(camera_id)
                    .ok_or_else(|| VisionError::UnknownCamera(camera_id.to_string()))?;
                if state.running.load(Ordering::SeqCst) {
                    return Ok(());
                }
                if let Some(previous) = state.supervisor.take() {
                    if !previous.is_finished() {
                        state.supervisor = Some(previous);
                        return Err(anyhow!("camera {} is still shutting down", camera_id));
                    }
                    let _ = previous.join();
                }
                if state.consumed || state.pipeline.is_stopped() {
                    // A zone update landed while building: build again.
                    if let Some((built_from, built)) = replacement.take() {
                        if built_from == state.settings {
                            state.pipeline = Arc::new(built.pipeline);
                            state.zones = built.zones;
                            state.consumed = false;
                        }
                    }
                }
                if !state.consumed && !state.pipeline.is_stopped() {
                    return self.launch(camera_id, state);
                }
                state.settings.clone()
            };
            let built = self.builder.build(&settings)?;
            replacement = Some((settings, built));
        }
    }

    fn launch(&self, camera_id: &str, state: &mut CameraState) -> Result<()> {
        let supervisor = Supervisor {
            camera_id: camera_id.to_string(),
            pipeline: state.pipeline.clone(),
            zones: state.zones.clone(),
            running: state.running.clone(),
            frames: state.frames.clone(),
            last_error: state.last_error.clone(),
            broadcaster: self.broadcaster.clone(),
            broadcast_interval: self.broadcast_interval,
        };
        *state.last_error.lock().unwrap_or_else(|p| p.into_inner()) = None;
        state.running.store(true, Ordering::SeqCst);
        state.consumed = true;
        let handle = thread::Builder::new()
            .name(format!("camera:{}", camera_id))
            .spawn(move || supervisor.run());
        match handle {
            Ok(handle) => {
                state.supervisor = Some(handle);
                log::info!("camera {} started", camera_id);
                Ok(())
            }
            Err(err) => {
                state.running.store(false, Ordering::SeqCst);
                Err(anyhow!("camera {}: failed to spawn supervisor: {}", camera_id, err))
            }
        }
    }

    pub fn stop_camera(&self, camera_id: &str) -> Result<()> {
        let (pipeline, supervisor) = {
            let mut cameras = self.lock();
            let state = cameras
                .get_mut(camera_id)
                .ok_or_else(|| VisionError::UnknownCamera(camera_id.to_string()))?;
            state.running.store(false, Ordering::SeqCst);
            (state.pipeline.clone(), state.supervisor.take())
        };
        pipeline.stop();
        if let Some(handle) = supervisor {
            if let Err(err) = join_bounded(handle, SUPERVISOR_JOIN_TIMEOUT) {
                log::warn!("camera {}: supervisor abandoned: {:#}", camera_id, err);
            }
        }
        log::info!("camera {} stopped", camera_id);
        Ok(())
    }

    /// Start every camera concurrently. Each failure is logged; the first is returned.
    pub fn start_all(&self) -> Result<()> {
        self.fan_out("start", |id| self.start_camera(id))
    }

    pub fn stop_all(&self) -> Result<()> {
        self.fan_out("stop", |id| self.stop_camera(id))
    }

    fn fan_out<F>(&self, action: &str, op: F) -> Result<()>
    where
        F: Fn(&str) -> Result<()> + Sync,
    {
        let ids = self.camera_ids();
        let results: Vec<(String, Result<()>)> = thread::scope(|scope| {
            let handles: Vec<_> = ids
                .iter()
                .map(|id| {
                    let op = &op;
                    (id.clone(), scope.spawn(move || op(id)))
                })
                .collect();
            handles
                .into_iter()
                .map(|(id, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("{} thread panicked", action)));
                    (id, result)
                })
                .collect()
        });

        let mut first_error = None;
        for (id, result) in results {
            if let Err(err) = result {
                log::error!("camera {}: {} failed: {:#}", id, action, err);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_running(&self, camera_id: &str) -> Result<bool> {
        self.lock()
            .get(camera_id)
            .map(|state| state.running.load(Ordering::SeqCst))
            .ok_or_else(|| VisionError::UnknownCamera(camera_id.to_string()).into())
    }

    pub fn get_status(&self) -> BTreeMap<String, CameraStatus> {
        self.lock()
            .iter()
            .map(|(id, state)| (id.clone(), state.status()))
            .collect()
    }

    pub fn camera_status(&self, camera_id: &str) -> Result<CameraStatus> {
        self.lock()
            .get(camera_id)
            .map(CameraState::status)
            .ok_or_else(|| VisionError::UnknownCamera(camera_id.to_string()).into())
    }

    pub fn metrics(&self) -> BTreeMap<String, MetricsSnapshot> {
        self.lock()
            .iter()
            .map(|(id, state)| (id.clone(), state.pipeline.metrics().snapshot()))
            .collect()
    }

    /// Replace (or add) a zone polygon while the camera keeps running.
    pub fn update_zone(&self, camera_id: &str, zone_id: &str, polygon: Vec<[f32; 2]>) -> Result<()> {
        let mut cameras = self.lock();
        let state = cameras
            .get_mut(camera_id)
            .ok_or_else(|| VisionError::UnknownCamera(camera_id.to_string()))?;
        state
            .zones
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .update_zone(zone_id, polygon.clone())?;
        match state.settings.zones.iter_mut().find(|z| z.zone_id == zone_id) {
            Some(zone) => zone.polygon = polygon,
            None => state.settings.zones.push(ZoneConfig {
                zone_id: zone_id.to_string(),
                polygon,
                camera_id: Some(camera_id.to_string()),
                street: None,
            }),
        }
        Ok(())
    }

    /// Latest raw or annotated frame; `Ok(None)` before the first frame arrives.
    pub fn latest_frame(&self, camera_id: &str, processed: bool) -> Result<Option<Arc<RgbImage>>> {
        self.lock()
            .get(camera_id)
            .map(|state| state.frames.get(processed))
            .ok_or_else(|| VisionError::UnknownCamera(camera_id.to_string()).into())
    }
}

impl Drop for CameraOrchestrator {
    fn drop(&mut self) {
        if let Err(err) = self.stop_all() {
            log::warn!("orchestrator shutdown: {:#}", err);
        }
    }
}

struct Supervisor {
    camera_id: String,
    pipeline: Arc<FramePipeline>,
    zones: SharedZones,
    running: Arc<AtomicBool>,
    frames: Arc<FrameSlots>,
    last_error: Arc<Mutex<Option<String>>>,
    broadcaster: Arc<Broadcaster<AnalysisMessage>>,
    broadcast_interval: Duration,
}

impl Supervisor {
    fn run(self) {
        match self.pipeline.run() {
            Ok(run) => {
                let mut last_broadcast: Option<Instant> = None;
                for (frame, analysis) in run {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    let raw = Arc::new(frame.image.into_rgb());
                    let polygons = self
                        .zones
                        .read()
                        .unwrap_or_else(|p| p.into_inner())
                        .polygons();
                    let processed = Arc::new(annotate(&raw, &analysis, &polygons));
                    self.frames.store(raw, processed);

                    if last_broadcast.map_or(true, |at| at.elapsed() >= self.broadcast_interval) {
                        let message = AnalysisMessage::from_analysis(&analysis, &self.camera_id);
                        self.broadcaster.broadcast(&self.camera_id, message);
                        last_broadcast = Some(Instant::now());
                    }
                }
            }
            Err(err) => {
                log::error!("camera {}: pipeline failed to start: {:#}", self.camera_id, err);
                self.record_error(format!("{:#}", err));
            }
        }

        let failure = self.pipeline.last_error();
        if let Some(err) = &failure {
            self.record_error(err.clone());
        }
        if self.running.swap(false, Ordering::SeqCst) {
            match failure {
                Some(err) => log::warn!("camera {}: pipeline died: {}", self.camera_id, err),
                None => log::info!("camera {}: stream ended", self.camera_id),
            }
        }
    }

    fn record_error(&self, message: String) {
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator() -> CameraOrchestrator {
        let builder = CameraBuilder::new(
            Arc::new(SourceRegistry::with_defaults()),
            Arc::new(DetectorRegistry::with_defaults()),
        )
        .with_persistence_defaults(PersistenceSettings {
            kind: "memory".to_string(),
            background: false,
            ..PersistenceSettings::default()
        });
        CameraOrchestrator::new(builder)
    }

    fn zone() -> ZoneConfig {
        ZoneConfig {
            zone_id: "zone1".to_string(),
            polygon: vec![[0.0, 0.0], [64.0, 0.0], [64.0, 48.0], [0.0, 48.0]],
            camera_id: None,
            street: None,
        }
    }

    #[test]
    fn duplicate_camera_is_rejected() {
        let orchestrator = orchestrator();
        let settings = CameraSettings::new("", "stub://a?frames=1", "synthetic");
        orchestrator.add_camera("a", settings.clone()).unwrap();
        let err = orchestrator.add_camera("a", settings).unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(VisionError::DuplicateCamera(id)) if id == "a"
        ));
    }

    #[test]
    fn zones_inherit_camera_id() {
        let orchestrator = orchestrator();
        let mut settings = CameraSettings::new("", "stub://a?frames=1", "synthetic");
        settings.zones.push(zone());
        orchestrator.add_camera("north", settings).unwrap();
        let status = orchestrator.camera_status("north").unwrap();
        assert_eq!(status.zones, vec!["zone1"]);
        assert!(!status.running);
        let cameras = orchestrator.lock();
        assert_eq!(
            cameras["north"].settings.zones[0].camera_id.as_deref(),
            Some("north")
        );
    }

    #[test]
    fn unknown_camera_operations_fail() {
        let orchestrator = orchestrator();
        for result in [
            orchestrator.start_camera("ghost"),
            orchestrator.stop_camera("ghost"),
            orchestrator.update_zone("ghost", "z", vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]),
        ] {
            let err = result.unwrap_err();
            assert!(matches!(
                crate::error::classify(&err),
                Some(VisionError::UnknownCamera(_))
            ));
        }
    }

    #[test]
    fn update_zone_is_kept_in_settings() {
        let orchestrator = orchestrator();
        let mut settings = CameraSettings::new("", "stub://a?frames=1", "synthetic");
        settings.zones.push(zone());
        orchestrator.add_camera("cam", settings).unwrap();
        orchestrator
            .update_zone("cam", "zone2", vec![[0.0, 0.0], [5.0, 0.0], [0.0, 5.0]])
            .unwrap();
        assert_eq!(
            orchestrator.camera_status("cam").unwrap().zones,
            vec!["zone1", "zone2"]
        );
        let cameras = orchestrator.lock();
        assert_eq!(cameras["cam"].settings.zones.len(), 2);
    }
}
