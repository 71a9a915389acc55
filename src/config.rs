use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::DetectorSettings;
use crate::error::VisionError;
use crate::ingest::{ReconnectPolicy, SourceSpec};
use crate::pipeline::PipelineConfig;
use crate::processor::DetectionErrorPolicy;
use crate::speed::SpeedSettings;
use crate::tracking::TrackerSettings;
use crate::zones::{ZoneConfig, ZoneCounter};

const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 2000;
const DEFAULT_DB_PATH: &str = "traffic_data.db";
const DEFAULT_PERSISTENCE_KIND: &str = "sqlite";
const DEFAULT_WINDOW_SECS: f64 = 60.0;
const DEFAULT_CAMERA_ID: &str = "front_camera";
const DEFAULT_SOURCE: &str = "stub://front_camera";
const DEFAULT_SOURCE_FPS: u32 = 30;
/// Camera ids that collide with fixed API routes.
pub const RESERVED_CAMERA_IDS: &[&str] = &["status"];

#[derive(Debug, Deserialize, Default)]
struct AppConfigFile {
    api: Option<ApiConfigFile>,
    broadcast_interval_ms: Option<u64>,
    persistence: Option<PersistenceSettings>,
    detector: Option<DetectorSettings>,
    cameras: Option<Vec<CameraSettings>>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

/// Where aggregated records go. `kind` is `sqlite`, `csv` or `memory`; for
/// `csv` the path is a directory of daily files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub kind: String,
    pub path: PathBuf,
    pub window_secs: f64,
    /// Hand flushes to a background writer thread.
    pub background: bool,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: DEFAULT_PERSISTENCE_KIND.to_string(),
            path: PathBuf::from(DEFAULT_DB_PATH),
            window_secs: DEFAULT_WINDOW_SECS,
            background: true,
        }
    }
}

impl PersistenceSettings {
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.kind.as_str(), "sqlite" | "csv" | "memory") {
            return Err(VisionError::config(format!(
                "unknown persistence kind '{}' (expected sqlite, csv or memory)",
                self.kind
            ))
            .into());
        }
        if !(self.window_secs.is_finite() && self.window_secs > 0.0) {
            return Err(VisionError::config("aggregation window must be greater than zero").into());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSettings {
    /// Run the detector on every n-th frame id and reuse the last analysis in between.
    pub detect_every_n: u64,
    pub frame_queue_size: usize,
    pub result_queue_size: usize,
    pub min_prebuffer: usize,
    /// Output pacing of the pipeline; 0 leaves it unpaced.
    pub target_fps: f64,
    pub mild_lag_secs: f64,
    pub severe_lag_secs: f64,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            detect_every_n: 1,
            frame_queue_size: pipeline.frame_queue_size,
            result_queue_size: pipeline.result_queue_size,
            min_prebuffer: pipeline.min_prebuffer,
            target_fps: pipeline.target_fps,
            mild_lag_secs: pipeline.mild_lag_secs,
            severe_lag_secs: pipeline.severe_lag_secs,
        }
    }
}

impl PerformanceSettings {
    pub fn pipeline_config(&self, on_detection_error: DetectionErrorPolicy) -> PipelineConfig {
        PipelineConfig {
            frame_queue_size: self.frame_queue_size,
            result_queue_size: self.result_queue_size,
            min_prebuffer: self.min_prebuffer,
            target_fps: self.target_fps,
            mild_lag_secs: self.mild_lag_secs,
            severe_lag_secs: self.severe_lag_secs,
            on_detection_error,
            ..PipelineConfig::default()
        }
    }
}

/// One camera, as configured in the file or posted to the API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub camera_id: String,
    pub source: String,
    /// Source kind for the registry (`synthetic`, `stream`, `images`, ...).
    pub source_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub source_fps: u32,
    pub reconnect: ReconnectPolicy,
    /// Falls back to the application-wide detector settings.
    pub detector: Option<DetectorSettings>,
    pub zones: Vec<ZoneConfig>,
    pub performance: PerformanceSettings,
    pub tracker: TrackerSettings,
    pub speed: SpeedSettings,
    /// Falls back to the application-wide persistence settings.
    pub persistence: Option<PersistenceSettings>,
    pub on_detection_error: DetectionErrorPolicy,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            camera_id: String::new(),
            source: DEFAULT_SOURCE.to_string(),
            source_type: "synthetic".to_string(),
            width: None,
            height: None,
            source_fps: DEFAULT_SOURCE_FPS,
            reconnect: ReconnectPolicy::default(),
            detector: None,
            zones: Vec::new(),
            performance: PerformanceSettings::default(),
            tracker: TrackerSettings::default(),
            speed: SpeedSettings::default(),
            persistence: None,
            on_detection_error: DetectionErrorPolicy::default(),
        }
    }
}

impl CameraSettings {
    pub fn new(camera_id: &str, source: &str, source_type: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            source: source.to_string(),
            source_type: source_type.to_string(),
            ..Self::default()
        }
    }

    pub fn source_spec(&self) -> SourceSpec {
        let mut spec = SourceSpec::new(self.source.clone(), self.source_type.clone());
        spec.width = self.width;
        spec.height = self.height;
        spec.target_fps = self.source_fps;
        spec.reconnect = self.reconnect.clone();
        spec
    }

    /// Fill `camera_id` on zones that lack one.
    pub fn inject_camera_id(&mut self) {
        for zone in &mut self.zones {
            if zone.camera_id.is_none() {
                zone.camera_id = Some(self.camera_id.clone());
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera_id.trim().is_empty() {
            return Err(VisionError::config("camera_id must not be empty").into());
        }
        if RESERVED_CAMERA_IDS.contains(&self.camera_id.as_str()) {
            return Err(VisionError::config(format!(
                "camera_id '{}' is reserved",
                self.camera_id
            ))
            .into());
        }
        if self.source.trim().is_empty() {
            return Err(VisionError::config(format!(
                "camera {}: source must not be empty",
                self.camera_id
            ))
            .into());
        }
        if self.performance.detect_every_n == 0 {
            return Err(VisionError::config(format!(
                "camera {}: detect_every_n must be at least 1",
                self.camera_id
            ))
            .into());
        }
        if self.speed.enabled && !(self.speed.pixels_per_meter > 0.0) {
            return Err(VisionError::config(format!(
                "camera {}: pixels_per_meter must be greater than zero",
                self.camera_id
            ))
            .into());
        }
        if !(0.0..=1.0).contains(&self.tracker.iou_threshold) {
            return Err(VisionError::config(format!(
                "camera {}: tracker iou_threshold must be within [0, 1]",
                self.camera_id
            ))
            .into());
        }
        ZoneCounter::for_camera(&self.zones, &self.camera_id)?;
        self.performance
            .pipeline_config(self.on_detection_error)
            .validate()?;
        if let Some(persistence) = &self.persistence {
            persistence.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_addr: String,
    pub broadcast_interval: Duration,
    pub persistence: PersistenceSettings,
    pub detector: DetectorSettings,
    pub cameras: Vec<CameraSettings>,
}

impl AppConfig {
    /// Load from the file named by `TRAFFIC_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TRAFFIC_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AppConfigFile) -> Self {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let broadcast_interval = Duration::from_millis(
            file.broadcast_interval_ms
                .unwrap_or(DEFAULT_BROADCAST_INTERVAL_MS),
        );
        let cameras = file
            .cameras
            .unwrap_or_else(|| vec![default_camera()])
            .into_iter()
            .map(|mut camera| {
                camera.inject_camera_id();
                camera
            })
            .collect();
        Self {
            api_addr,
            broadcast_interval,
            persistence: file.persistence.unwrap_or_default(),
            detector: file.detector.unwrap_or_default(),
            cameras,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("TRAFFIC_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(path) = std::env::var("TRAFFIC_DB_PATH") {
            if !path.trim().is_empty() {
                self.persistence.path = PathBuf::from(path);
            }
        }
        if let Ok(interval) = std::env::var("TRAFFIC_BROADCAST_INTERVAL_MS") {
            let millis: u64 = interval.parse().map_err(|_| {
                anyhow!("TRAFFIC_BROADCAST_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.broadcast_interval = Duration::from_millis(millis);
        }
        if let Ok(window) = std::env::var("TRAFFIC_WINDOW_SECS") {
            self.persistence.window_secs = window
                .parse()
                .map_err(|_| anyhow!("TRAFFIC_WINDOW_SECS must be a number of seconds"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.broadcast_interval.is_zero() {
            return Err(VisionError::config("broadcast interval must be greater than zero").into());
        }
        self.persistence.validate()?;
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            camera.validate()?;
            if !seen.insert(camera.camera_id.as_str()) {
                return Err(VisionError::DuplicateCamera(camera.camera_id.clone()).into());
            }
        }
        Ok(())
    }
}

fn default_camera() -> CameraSettings {
    let mut camera = CameraSettings::new(DEFAULT_CAMERA_ID, DEFAULT_SOURCE, "synthetic");
    camera.zones = vec![ZoneConfig {
        zone_id: "zone1".to_string(),
        polygon: vec![[0.0, 240.0], [640.0, 240.0], [640.0, 480.0], [0.0, 480.0]],
        camera_id: None,
        street: None,
    }];
    camera
}

fn read_config_file(path: &Path) -> Result<AppConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path.extension().and_then(|ext| ext.to_str()) == Some("toml");
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_sections_fall_back_to_defaults() {
        let cfg = AppConfig::from_file(AppConfigFile::default());
        assert_eq!(cfg.api_addr, DEFAULT_API_ADDR);
        assert_eq!(cfg.broadcast_interval, Duration::from_secs(2));
        assert_eq!(cfg.cameras.len(), 1);
        assert_eq!(cfg.cameras[0].zones[0].camera_id.as_deref(), Some(DEFAULT_CAMERA_ID));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn camera_settings_deserialize_from_partial_json() {
        let camera: CameraSettings = serde_json::from_str(
            r#"{
                "camera_id": "cam2",
                "source": "stub://north?frames=10",
                "zones": [{"zone_id": "z1", "polygon": [[0,0],[10,0],[10,10]]}],
                "performance": {"detect_every_n": 3},
                "on_detection_error": "stop"
            }"#,
        )
        .unwrap();
        assert_eq!(camera.performance.detect_every_n, 3);
        assert_eq!(camera.performance.frame_queue_size, 10);
        assert_eq!(camera.on_detection_error, DetectionErrorPolicy::Stop);
        assert_eq!(camera.source_type, "synthetic");
        assert!(camera.validate().is_ok());
    }

    #[test]
    fn invalid_zone_is_a_configuration_error() {
        let mut camera = CameraSettings::new("cam", "stub://cam", "synthetic");
        camera.zones.push(ZoneConfig {
            zone_id: "bad".to_string(),
            polygon: vec![[0.0, 0.0], [1.0, 1.0]],
            camera_id: None,
            street: None,
        });
        let err = camera.validate().unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(VisionError::Configuration(_))
        ));
    }

    #[test]
    fn reserved_camera_ids_are_rejected() {
        let camera = CameraSettings::new("status", "stub://status", "synthetic");
        let err = camera.validate().unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(VisionError::Configuration(_))
        ));
        assert!(CameraSettings::new("statuses", "stub://s", "synthetic").validate().is_ok());
    }

    #[test]
    fn toml_files_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traffic.toml");
        std::fs::write(
            &path,
            r#"
broadcast_interval_ms = 500

[api]
addr = "0.0.0.0:9100"

[[cameras]]
camera_id = "east"
source = "stub://east"
"#,
        )
        .unwrap();
        let file = read_config_file(&path).unwrap();
        let cfg = AppConfig::from_file(file);
        assert_eq!(cfg.api_addr, "0.0.0.0:9100");
        assert_eq!(cfg.broadcast_interval, Duration::from_millis(500));
        assert_eq!(cfg.cameras[0].camera_id, "east");
    }
}
