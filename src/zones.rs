//! Zone geometry and per-frame zone statistics.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::VisionError;
use crate::model::{DetectedVehicle, ZoneVehicleCount};

const UNKNOWN: &str = "unknown";

/// Zone definition as it appears in configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub zone_id: String,
    pub polygon: Vec<[f32; 2]>,
    #[serde(default)]
    pub camera_id: Option<String>,
    #[serde(default)]
    pub street: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Polygon {
    points: Vec<[f32; 2]>,
}

impl Polygon {
    pub fn new(points: Vec<[f32; 2]>) -> Result<Self> {
        if points.len() < 3 {
            return Err(VisionError::config(format!(
                "zone polygon needs at least 3 points, got {}",
                points.len()
            ))
            .into());
        }
        if points.iter().flatten().any(|c| !c.is_finite()) {
            return Err(VisionError::config("zone polygon has non-finite coordinates").into());
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[[f32; 2]] {
        &self.points
    }

    /// Shoelace area.
    pub fn area(&self) -> f32 {
        let n = self.points.len();
        let twice: f32 = (0..n)
            .map(|i| {
                let [x1, y1] = self.points[i];
                let [x2, y2] = self.points[(i + 1) % n];
                x1 * y2 - x2 * y1
            })
            .sum();
        twice.abs() / 2.0
    }

    /// Even-odd ray cast.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        let n = self.points.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let [xi, yi] = self.points[i];
            let [xj, yj] = self.points[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

struct Zone {
    id: String,
    polygon: Polygon,
    area: f32,
    camera_id: String,
    street: String,
}

/// Counts vehicles per zone by their bottom-center point.
pub struct ZoneCounter {
    zones: Vec<Zone>,
    default_camera_id: String,
}

/// Zone state shared between a camera's processing worker and the API.
pub type SharedZones = Arc<RwLock<ZoneCounter>>;

impl ZoneCounter {
    pub fn new(configs: &[ZoneConfig]) -> Result<Self> {
        Self::for_camera(configs, UNKNOWN)
    }

    /// Zones lacking a `camera_id` inherit `camera_id`.
    pub fn for_camera(configs: &[ZoneConfig], camera_id: &str) -> Result<Self> {
        let mut counter = Self {
            zones: Vec::with_capacity(configs.len()),
            default_camera_id: camera_id.to_string(),
        };
        for config in configs {
            if counter.zones.iter().any(|z| z.id == config.zone_id) {
                return Err(VisionError::config(format!(
                    "duplicate zone id '{}'",
                    config.zone_id
                ))
                .into());
            }
            let polygon = Polygon::new(config.polygon.clone())?;
            counter.zones.push(Zone {
                id: config.zone_id.clone(),
                area: polygon.area(),
                polygon,
                camera_id: config
                    .camera_id
                    .clone()
                    .unwrap_or_else(|| camera_id.to_string()),
                street: config.street.clone().unwrap_or_else(|| UNKNOWN.to_string()),
            });
        }
        Ok(counter)
    }

    pub fn into_shared(self) -> SharedZones {
        Arc::new(RwLock::new(self))
    }

    pub fn zone_ids(&self) -> Vec<String> {
        self.zones.iter().map(|z| z.id.clone()).collect()
    }

    pub fn area(&self, zone_id: &str) -> Option<f32> {
        self.zones.iter().find(|z| z.id == zone_id).map(|z| z.area)
    }

    pub fn polygons(&self) -> Vec<(String, Polygon)> {
        self.zones
            .iter()
            .map(|z| (z.id.clone(), z.polygon.clone()))
            .collect()
    }

    /// Replace (or add) a zone's polygon at runtime. Metadata of an existing zone
    /// is kept and the cached area is recomputed.
    pub fn update_zone(&mut self, zone_id: &str, points: Vec<[f32; 2]>) -> Result<()> {
        let polygon = Polygon::new(points)?;
        let area = polygon.area();
        match self.zones.iter_mut().find(|z| z.id == zone_id) {
            Some(zone) => {
                zone.polygon = polygon;
                zone.area = area;
            }
            None => self.zones.push(Zone {
                id: zone_id.to_string(),
                polygon,
                area,
                camera_id: self.default_camera_id.clone(),
                street: UNKNOWN.to_string(),
            }),
        }
        log::info!("zone {} updated (area {:.1} px²)", zone_id, area);
        Ok(())
    }

    /// One record per configured zone, in configuration order, even when empty.
    pub fn count(&self, vehicles: &[DetectedVehicle], timestamp: f64) -> Vec<ZoneVehicleCount> {
        self.zones
            .iter()
            .map(|zone| {
                let mut record =
                    ZoneVehicleCount::empty(&zone.id, &zone.camera_id, &zone.street, timestamp);
                let inside: Vec<&DetectedVehicle> = vehicles
                    .iter()
                    .filter(|v| {
                        let (x, y) = v.bbox.bottom_center();
                        zone.polygon.contains(x, y)
                    })
                    .collect();
                if inside.is_empty() {
                    return record;
                }

                record.vehicle_count = inside.len();
                let speeds: Vec<f32> = inside.iter().filter_map(|v| v.speed).collect();
                if !speeds.is_empty() {
                    record.avg_speed = speeds.iter().sum::<f32>() / speeds.len() as f32;
                }
                let mut types = BTreeMap::new();
                for vehicle in &inside {
                    *types.entry(vehicle.vehicle_type).or_insert(0) += 1;
                    record.vehicles.push(vehicle.id.clone());
                    record
                        .vehicle_details
                        .insert(vehicle.id.clone(), vehicle.vehicle_type);
                }
                record.vehicle_types = types;
                if zone.area > 0.0 {
                    let covered: f32 = inside.iter().map(|v| v.bbox.area()).sum();
                    record.occupancy = (covered / zone.area).clamp(0.0, 1.0);
                }
                record
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BBox, VehicleType};

    fn square(id: &str, size: f32) -> ZoneConfig {
        ZoneConfig {
            zone_id: id.to_string(),
            polygon: vec![[0.0, 0.0], [size, 0.0], [size, size], [0.0, size]],
            camera_id: None,
            street: Some("Main St".to_string()),
        }
    }

    fn vehicle(id: &str, vehicle_type: VehicleType, bbox: BBox, speed: Option<f32>) -> DetectedVehicle {
        let mut v = DetectedVehicle::new(vehicle_type, 0.9, bbox, 1.0);
        v.id = id.to_string();
        v.speed = speed;
        v
    }

    #[test]
    fn occupancy_of_one_box_in_square_zone() -> Result<()> {
        let counter = ZoneCounter::for_camera(&[square("zone1", 100.0)], "cam1")?;
        assert_eq!(counter.area("zone1"), Some(10_000.0));

        let vehicles = vec![vehicle("1", VehicleType::Car, BBox::new(10.0, 10.0, 50.0, 50.0), None)];
        let records = counter.count(&vehicles, 1.0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].vehicle_count, 1);
        assert!((records[0].occupancy - 0.16).abs() < 1e-6);
        assert_eq!(records[0].camera_id, "cam1");
        assert_eq!(records[0].street_monitored, "Main St");
        assert_eq!(records[0].vehicle_details.get("1"), Some(&VehicleType::Car));
        Ok(())
    }

    #[test]
    fn occupancy_is_capped_and_speed_ignores_unknowns() -> Result<()> {
        let counter = ZoneCounter::new(&[square("z", 10.0)])?;
        let vehicles = vec![
            vehicle("1", VehicleType::Bus, BBox::new(-50.0, -50.0, 60.0, 5.0), Some(30.0)),
            vehicle("2", VehicleType::Car, BBox::new(1.0, 1.0, 4.0, 4.0), Some(10.0)),
            vehicle("3", VehicleType::Car, BBox::new(2.0, 2.0, 3.0, 3.0), None),
        ];
        let record = &counter.count(&vehicles, 2.0)[0];
        assert_eq!(record.vehicle_count, 3);
        assert_eq!(record.occupancy, 1.0);
        assert!((record.avg_speed - 20.0).abs() < 1e-6);
        assert_eq!(record.vehicle_types.get(&VehicleType::Car), Some(&2));
        assert_eq!(record.camera_id, "unknown");
        Ok(())
    }

    #[test]
    fn empty_zones_still_produce_records() -> Result<()> {
        let counter = ZoneCounter::new(&[square("a", 10.0), square("b", 10.0)])?;
        let records = counter.count(&[], 3.0);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.vehicle_count == 0 && r.occupancy == 0.0));
        Ok(())
    }

    #[test]
    fn degenerate_zone_has_zero_occupancy() -> Result<()> {
        let config = ZoneConfig {
            zone_id: "line".to_string(),
            polygon: vec![[0.0, 0.0], [10.0, 0.0], [20.0, 0.0]],
            camera_id: None,
            street: None,
        };
        let counter = ZoneCounter::new(&[config])?;
        assert_eq!(counter.area("line"), Some(0.0));
        let vehicles = vec![vehicle("1", VehicleType::Car, BBox::new(0.0, -5.0, 4.0, 0.0), None)];
        assert_eq!(counter.count(&vehicles, 0.0)[0].occupancy, 0.0);
        Ok(())
    }

    #[test]
    fn update_zone_replaces_polygon_and_area() -> Result<()> {
        let mut counter = ZoneCounter::for_camera(&[square("zone1", 100.0)], "cam1")?;
        counter.update_zone("zone1", vec![[0.0, 0.0], [20.0, 0.0], [20.0, 20.0], [0.0, 20.0]])?;
        assert_eq!(counter.area("zone1"), Some(400.0));
        counter.update_zone("zone2", vec![[0.0, 0.0], [5.0, 0.0], [0.0, 5.0]])?;
        assert_eq!(counter.zone_ids(), vec!["zone1", "zone2"]);
        assert!(counter.update_zone("zone3", vec![[0.0, 0.0], [1.0, 1.0]]).is_err());

        let records = counter.count(&[], 0.0);
        assert_eq!(records[1].camera_id, "cam1");
        Ok(())
    }

    #[test]
    fn duplicate_zone_ids_are_rejected() {
        assert!(ZoneCounter::new(&[square("a", 10.0), square("a", 5.0)]).is_err());
    }
}
