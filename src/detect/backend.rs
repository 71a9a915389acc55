use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::frame::FrameImage;
use crate::model::{FrameAnalysis, VehicleType};

/// Vehicle detector.
///
/// Implementations return raw per-frame detections: `DetectedVehicle::id` is
/// left empty and `speed` is `None`. Identity, speed and zone statistics are
/// added downstream by the processor chain. Only the four vehicle classes are
/// reported; everything else the model sees is dropped here.
///
/// A detector instance belongs to one camera's processing worker and is never
/// shared, so `detect` takes `&mut self`.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. Failures should be `VisionError::Detection`.
    fn detect(&mut self, image: &FrameImage, frame_id: u64, timestamp: f64)
        -> Result<FrameAnalysis>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    /// Registered backend name. Empty selects the registry default.
    pub backend: String,
    pub confidence_threshold: f32,
    /// JSON-lines detections file for the `replay` backend.
    pub replay_path: Option<PathBuf>,
    /// Seed for the `synthetic` backend.
    pub seed: u64,
    /// Lanes simulated by the `synthetic` backend.
    pub lanes: u32,
    /// Extra model class ids mapped onto vehicle types, on top of COCO.
    pub class_overrides: BTreeMap<u32, VehicleType>,
}

impl DetectorSettings {
    /// Vehicle type for a numeric model class. Overrides win over COCO ids.
    pub fn vehicle_type_for(&self, class_id: u32) -> Option<VehicleType> {
        self.class_overrides
            .get(&class_id)
            .copied()
            .or_else(|| VehicleType::from_coco_class(class_id))
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: String::new(),
            confidence_threshold: 0.5,
            replay_path: None,
            seed: 7,
            lanes: 3,
            class_overrides: BTreeMap::new(),
        }
    }
}
