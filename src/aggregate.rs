//! Time-windowed traffic aggregation.
//!
//! Buffers per-frame zone records and reduces them into one `TrafficData` per
//! zone when the window elapses. Flow counts distinct vehicle ids, and each id's
//! type is resolved by majority vote over everything observed in the window, so
//! the per-type counts always sum to `total_vehicles`.

use std::collections::{BTreeMap, HashMap};

use crate::model::{FrameAnalysis, TrafficData, VehicleType, ZoneVehicleCount};
use crate::now_s;
use crate::storage::TrafficRepository;
use crate::tracking::majority_vote;

pub struct TrafficAggregator {
    repository: Box<dyn TrafficRepository>,
    window_secs: f64,
    buffer: Vec<ZoneVehicleCount>,
    frames_buffered: usize,
    last_flush: f64,
    persist_failures: u64,
}

impl TrafficAggregator {
    pub fn new(repository: Box<dyn TrafficRepository>, window_secs: f64) -> Self {
        Self::starting_at(repository, window_secs, now_s())
    }

    pub fn starting_at(repository: Box<dyn TrafficRepository>, window_secs: f64, start: f64) -> Self {
        Self {
            repository,
            window_secs,
            buffer: Vec::new(),
            frames_buffered: 0,
            last_flush: start,
            persist_failures: 0,
        }
    }

    pub fn window_secs(&self) -> f64 {
        self.window_secs
    }

    pub fn frames_buffered(&self) -> usize {
        self.frames_buffered
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures
    }

    /// Buffer `analysis` and flush if the window has elapsed.
    pub fn aggregate_and_persist(&mut self, analysis: &FrameAnalysis) -> Vec<TrafficData> {
        self.aggregate_and_persist_at(analysis, now_s())
    }

    pub fn aggregate_and_persist_at(&mut self, analysis: &FrameAnalysis, now: f64) -> Vec<TrafficData> {
        self.buffer.extend(analysis.zones.iter().cloned());
        self.frames_buffered += 1;
        if now - self.last_flush >= self.window_secs {
            self.flush_at(now)
        } else {
            Vec::new()
        }
    }

    /// Flush regardless of the window, e.g. on shutdown.
    pub fn force_flush(&mut self) -> Vec<TrafficData> {
        self.flush_at(now_s())
    }

    /// Reduce, persist, clear, and restart the window at `now`.
    pub fn flush_at(&mut self, now: f64) -> Vec<TrafficData> {
        let duration = now - self.last_flush;
        let records = summarize(&self.buffer, now, duration);
        if !records.is_empty() {
            if let Err(err) = self.repository.save_batch(&records) {
                self.persist_failures += 1;
                log::warn!(
                    "aggregator: failed to persist {} records to {}: {:#}",
                    records.len(),
                    self.repository.describe(),
                    err
                );
            } else {
                log::info!(
                    "aggregator: flushed {} zone records ({} frames, {:.1}s window)",
                    records.len(),
                    self.frames_buffered,
                    duration
                );
            }
        }
        self.buffer.clear();
        self.frames_buffered = 0;
        self.last_flush = now;
        records
    }
}

/// Reduce buffered zone records into one `TrafficData` per zone id (sorted by id).
pub fn summarize(buffer: &[ZoneVehicleCount], timestamp: f64, duration: f64) -> Vec<TrafficData> {
    let mut by_zone: BTreeMap<&str, Vec<&ZoneVehicleCount>> = BTreeMap::new();
    for record in buffer {
        by_zone.entry(record.zone_id.as_str()).or_default().push(record);
    }

    by_zone
        .into_iter()
        .filter_map(|(zone_id, records)| {
            let first = records.first()?;
            let n = records.len() as f64;
            let avg_density = records.iter().map(|r| r.vehicle_count as f64).sum::<f64>() / n;
            let avg_occupancy = records.iter().map(|r| r.occupancy as f64).sum::<f64>() / n;

            let (speed_sum, weight) = records
                .iter()
                .filter(|r| r.avg_speed > 0.0 && r.vehicle_count > 0)
                .fold((0.0f64, 0usize), |(sum, count), r| {
                    (sum + r.avg_speed as f64 * r.vehicle_count as f64, count + r.vehicle_count)
                });
            let avg_speed = if weight > 0 {
                speed_sum / weight as f64
            } else {
                0.0
            };

            let mut observations: HashMap<&str, Vec<VehicleType>> = HashMap::new();
            for record in &records {
                for (vehicle_id, vehicle_type) in &record.vehicle_details {
                    observations
                        .entry(vehicle_id.as_str())
                        .or_default()
                        .push(*vehicle_type);
                }
            }
            let mut vehicle_types: BTreeMap<VehicleType, usize> = BTreeMap::new();
            for votes in observations.values() {
                if let Some(resolved) = majority_vote(votes.iter().copied()) {
                    *vehicle_types.entry(resolved).or_insert(0) += 1;
                }
            }
            let total_vehicles = observations.len();
            let count_of = |t: VehicleType| vehicle_types.get(&t).copied().unwrap_or(0);

            Some(TrafficData {
                timestamp,
                zone_id: zone_id.to_string(),
                camera_id: first.camera_id.clone(),
                street_monitored: first.street_monitored.clone(),
                duration_seconds: duration,
                avg_density,
                total_vehicles,
                avg_speed,
                avg_occupancy,
                flow_rate_per_min: total_vehicles,
                car_count: count_of(VehicleType::Car),
                bus_count: count_of(VehicleType::Bus),
                truck_count: count_of(VehicleType::Truck),
                motorcycle_count: count_of(VehicleType::Motorcycle),
                vehicle_types: vehicle_types.clone(),
            })
        })
        .collect()
}
