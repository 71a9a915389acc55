//! Replays detections recorded by an external model.
//!
//! Input is JSON lines, one object per frame:
//!
//! ```text
//! {"frame_id": 12, "detections": [{"class": "car", "confidence": 0.91, "bbox": [10, 20, 110, 90]}]}
//! ```
//!
//! `class` is either a vehicle name or a COCO class id. Non-vehicle classes and
//! detections below the confidence threshold are dropped. Frames without a
//! line yield an empty analysis.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::detect::backend::{Detector, DetectorSettings};
use crate::error::VisionError;
use crate::frame::FrameImage;
use crate::model::{BBox, DetectedVehicle, FrameAnalysis, VehicleType};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RecordedClass {
    Coco(u32),
    Name(String),
}

impl RecordedClass {
    fn vehicle_type(&self, settings: &DetectorSettings) -> Option<VehicleType> {
        match self {
            RecordedClass::Coco(id) => settings.vehicle_type_for(*id),
            RecordedClass::Name(name) => name.parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RecordedDetection {
    class: RecordedClass,
    confidence: f32,
    bbox: [f32; 4],
}

#[derive(Debug, Deserialize)]
struct RecordedFrame {
    frame_id: u64,
    #[serde(default)]
    detections: Vec<RecordedDetection>,
}

pub struct ReplayDetector {
    frames: HashMap<u64, Vec<RecordedDetection>>,
    settings: DetectorSettings,
}

impl ReplayDetector {
    pub fn from_path(path: &Path, settings: &DetectorSettings) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            VisionError::config(format!("cannot open replay file {}: {}", path.display(), e))
        })?;
        Self::from_reader(BufReader::new(file), settings)
            .with_context(|| format!("load replay file {}", path.display()))
    }

    pub fn from_reader<R: BufRead>(reader: R, settings: &DetectorSettings) -> Result<Self> {
        let mut frames = HashMap::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let recorded: RecordedFrame = serde_json::from_str(&line)
                .with_context(|| format!("replay line {}", line_no + 1))?;
            frames.insert(recorded.frame_id, recorded.detections);
        }
        Ok(Self {
            frames,
            settings: settings.clone(),
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

impl Detector for ReplayDetector {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn detect(
        &mut self,
        _image: &FrameImage,
        frame_id: u64,
        timestamp: f64,
    ) -> Result<FrameAnalysis> {
        let vehicles = self
            .frames
            .get(&frame_id)
            .map(|detections| {
                detections
                    .iter()
                    .filter(|d| d.confidence >= self.settings.confidence_threshold)
                    .filter_map(|d| {
                        d.class.vehicle_type(&self.settings).map(|vehicle_type| {
                            DetectedVehicle::new(
                                vehicle_type,
                                d.confidence,
                                BBox::from_array(d.bbox),
                                timestamp,
                            )
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(FrameAnalysis::new(frame_id, timestamp, vehicles))
    }
}
