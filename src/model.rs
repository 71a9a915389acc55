//! Domain records flowing through the pipeline.
//!
//! `DetectedVehicle` and `FrameAnalysis` are mutated only by the processing
//! worker that owns the camera's chain. `ZoneVehicleCount` and `TrafficData`
//! are built once and never mutated afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Car,
    Bus,
    Truck,
    Motorcycle,
}

impl VehicleType {
    pub const ALL: [VehicleType; 4] = [
        VehicleType::Car,
        VehicleType::Bus,
        VehicleType::Truck,
        VehicleType::Motorcycle,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VehicleType::Car => "car",
            VehicleType::Bus => "bus",
            VehicleType::Truck => "truck",
            VehicleType::Motorcycle => "motorcycle",
        }
    }

    /// COCO class ids emitted by the common YOLO vehicle models.
    pub fn from_coco_class(class_id: u32) -> Option<Self> {
        match class_id {
            2 => Some(VehicleType::Car),
            3 => Some(VehicleType::Motorcycle),
            5 => Some(VehicleType::Bus),
            7 => Some(VehicleType::Truck),
            _ => None,
        }
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "car" => Ok(VehicleType::Car),
            "bus" => Ok(VehicleType::Bus),
            "truck" => Ok(VehicleType::Truck),
            "motorcycle" | "motorbike" => Ok(VehicleType::Motorcycle),
            other => Err(anyhow!("unknown vehicle type '{}'", other)),
        }
    }
}

/// Axis-aligned box in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_array(xyxy: [f32; 4]) -> Self {
        Self::new(xyxy[0], xyxy[1], xyxy[2], xyxy[3])
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Bottom-center point, the ground-plane proxy used for zones and speed.
    pub fn bottom_center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, self.y2)
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedVehicle {
    /// Empty until the identity tracker assigns one.
    pub id: String,
    #[serde(rename = "type")]
    pub vehicle_type: VehicleType,
    pub confidence: f32,
    pub bbox: BBox,
    pub timestamp: f64,
    /// km/h, `None` until the speed estimator has two samples.
    pub speed: Option<f32>,
}

impl DetectedVehicle {
    pub fn new(vehicle_type: VehicleType, confidence: f32, bbox: BBox, timestamp: f64) -> Self {
        Self {
            id: String::new(),
            vehicle_type,
            confidence,
            bbox,
            timestamp,
            speed: None,
        }
    }
}

/// Per-zone, per-frame snapshot. One per configured zone every processed frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneVehicleCount {
    pub zone_id: String,
    pub vehicle_count: usize,
    pub vehicles: Vec<String>,
    pub vehicle_details: BTreeMap<String, VehicleType>,
    pub avg_speed: f32,
    pub occupancy: f32,
    pub vehicle_types: BTreeMap<VehicleType, usize>,
    pub camera_id: String,
    pub street_monitored: String,
    pub timestamp: f64,
}

impl ZoneVehicleCount {
    pub fn empty(zone_id: &str, camera_id: &str, street: &str, timestamp: f64) -> Self {
        Self {
            zone_id: zone_id.to_string(),
            vehicle_count: 0,
            vehicles: Vec::new(),
            vehicle_details: BTreeMap::new(),
            avg_speed: 0.0,
            occupancy: 0.0,
            vehicle_types: BTreeMap::new(),
            camera_id: camera_id.to_string(),
            street_monitored: street.to_string(),
            timestamp,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameAnalysis {
    pub frame_id: u64,
    pub timestamp: f64,
    pub vehicles: Vec<DetectedVehicle>,
    pub total_count: usize,
    /// Detector output size before tracking filtered it.
    pub raw_detection_count: usize,
    pub zones: Vec<ZoneVehicleCount>,
}

impl FrameAnalysis {
    pub fn new(frame_id: u64, timestamp: f64, vehicles: Vec<DetectedVehicle>) -> Self {
        let count = vehicles.len();
        Self {
            frame_id,
            timestamp,
            vehicles,
            total_count: count,
            raw_detection_count: count,
            zones: Vec::new(),
        }
    }

    pub fn empty(frame_id: u64, timestamp: f64) -> Self {
        Self::new(frame_id, timestamp, Vec::new())
    }
}

/// Aggregated record for one zone over one window. Flat layout, one row per
/// zone per flush.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrafficData {
    pub timestamp: f64,
    pub zone_id: String,
    pub camera_id: String,
    pub street_monitored: String,
    pub duration_seconds: f64,
    pub avg_density: f64,
    pub total_vehicles: usize,
    pub avg_speed: f64,
    pub avg_occupancy: f64,
    pub flow_rate_per_min: usize,
    pub car_count: usize,
    pub bus_count: usize,
    pub truck_count: usize,
    pub motorcycle_count: usize,
    pub vehicle_types: BTreeMap<VehicleType, usize>,
}

// ----------------------------------------------------------------------------
// Serialized analysis message (push stream / snapshot payload)
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisMessage {
    pub camera_id: String,
    pub timestamp: String,
    pub frame_id: u64,
    pub total_vehicles: usize,
    pub vehicles: Vec<VehicleMessage>,
    pub zones: Vec<ZoneMessage>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VehicleMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub vehicle_type: VehicleType,
    pub confidence: f32,
    pub bbox: [f32; 4],
    pub speed: Option<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneMessage {
    pub zone_id: String,
    pub vehicle_count: usize,
    pub avg_speed: f32,
    pub occupancy: f32,
    pub vehicle_types: BTreeMap<VehicleType, usize>,
}

impl AnalysisMessage {
    pub fn from_analysis(analysis: &FrameAnalysis, camera_id: &str) -> Self {
        Self::from_analysis_at(analysis, camera_id, Local::now())
    }

    pub fn from_analysis_at(
        analysis: &FrameAnalysis,
        camera_id: &str,
        now: DateTime<Local>,
    ) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            timestamp: now.to_rfc3339(),
            frame_id: analysis.frame_id,
            total_vehicles: analysis.total_count,
            vehicles: analysis
                .vehicles
                .iter()
                .map(|v| VehicleMessage {
                    id: v.id.clone(),
                    vehicle_type: v.vehicle_type,
                    confidence: round_to(v.confidence, 2),
                    bbox: v.bbox.to_array(),
                    speed: v.speed.map(|s| round_to(s, 1)),
                })
                .collect(),
            zones: analysis
                .zones
                .iter()
                .map(|z| ZoneMessage {
                    zone_id: z.zone_id.clone(),
                    vehicle_count: z.vehicle_count,
                    avg_speed: round_to(z.avg_speed, 1),
                    occupancy: round_to(z.occupancy, 2),
                    vehicle_types: z.vehicle_types.clone(),
                })
                .collect(),
        }
    }
}

fn round_to(value: f32, decimals: i32) -> f32 {
    let factor = 10f32.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
        let half = BBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&half) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn vehicle_type_parses_and_maps_coco() {
        assert_eq!("Truck".parse::<VehicleType>().unwrap(), VehicleType::Truck);
        assert!("bicycle".parse::<VehicleType>().is_err());
        assert_eq!(VehicleType::from_coco_class(5), Some(VehicleType::Bus));
        assert_eq!(VehicleType::from_coco_class(0), None);
    }

    #[test]
    fn message_rounds_and_serializes_type_field() {
        let mut vehicle = DetectedVehicle::new(
            VehicleType::Car,
            0.876,
            BBox::new(1.0, 2.0, 3.0, 4.0),
            10.0,
        );
        vehicle.id = "7".to_string();
        vehicle.speed = Some(42.46);
        let mut analysis = FrameAnalysis::new(3, 10.0, vec![vehicle]);
        let mut zone = ZoneVehicleCount::empty("zone1", "cam1", "Main St", 10.0);
        zone.occupancy = 0.1649;
        zone.avg_speed = 42.46;
        analysis.zones.push(zone);

        let msg = AnalysisMessage::from_analysis(&analysis, "cam1");
        assert_eq!(msg.vehicles[0].confidence, 0.88);
        assert_eq!(msg.vehicles[0].speed, Some(42.5));
        assert_eq!(msg.zones[0].occupancy, 0.16);

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["vehicles"][0]["type"], "car");
        assert_eq!(json["frame_id"], 3);
    }
}
