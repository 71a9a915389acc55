//! Identity tracking and class stabilization.
//!
//! `IouTracker` associates detections across consecutive frames by box
//! overlap. `IdentityTracker` layers per-identity class history on top so that
//! a single-frame misclassification does not change a vehicle's reported type.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::model::{BBox, DetectedVehicle, FrameAnalysis, VehicleType};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    /// Minimum IoU for a detection to continue an existing track.
    pub iou_threshold: f32,
    /// Minimum confidence for an unmatched detection to start a new track.
    pub activation_threshold: f32,
    /// Seconds without a matching detection before a track is dropped.
    pub lost_timeout_secs: f64,
    /// Raw class observations kept per identity.
    pub class_history_len: usize,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            activation_threshold: 0.15,
            lost_timeout_secs: 2.0,
            class_history_len: 30,
        }
    }
}

/// Multi-object association over consecutive frames.
pub trait Tracker: Send {
    /// Returns one entry per detection: the track id it was assigned, or
    /// `None` when it neither matched a track nor qualified to start one.
    fn update(&mut self, detections: &[DetectedVehicle], timestamp: f64) -> Vec<Option<u64>>;

    /// Track ids dropped since the last call.
    fn take_dropped(&mut self) -> Vec<u64>;

    fn active_tracks(&self) -> usize;
}

struct Track {
    id: u64,
    bbox: BBox,
    last_seen: f64,
}

/// Greedy IoU tracker. Track ids are monotonic and never reused.
pub struct IouTracker {
    iou_threshold: f32,
    activation_threshold: f32,
    lost_timeout_secs: f64,
    tracks: Vec<Track>,
    next_id: u64,
    dropped: Vec<u64>,
}

impl IouTracker {
    pub fn new(settings: &TrackerSettings) -> Self {
        Self {
            iou_threshold: settings.iou_threshold,
            activation_threshold: settings.activation_threshold,
            lost_timeout_secs: settings.lost_timeout_secs,
            tracks: Vec::new(),
            next_id: 1,
            dropped: Vec::new(),
        }
    }
}

impl Tracker for IouTracker {
    fn update(&mut self, detections: &[DetectedVehicle], timestamp: f64) -> Vec<Option<u64>> {
        let mut candidates = Vec::new();
        for (t, track) in self.tracks.iter().enumerate() {
            for (d, det) in detections.iter().enumerate() {
                let iou = track.bbox.iou(&det.bbox);
                if iou >= self.iou_threshold {
                    candidates.push((iou, t, d));
                }
            }
        }
        // Highest overlap first; index order keeps equal overlaps deterministic.
        candidates.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        let mut assigned = vec![None; detections.len()];
        let mut track_taken = vec![false; self.tracks.len()];
        for (_, t, d) in candidates {
            if track_taken[t] || assigned[d].is_some() {
                continue;
            }
            track_taken[t] = true;
            let track = &mut self.tracks[t];
            track.bbox = detections[d].bbox;
            track.last_seen = timestamp;
            assigned[d] = Some(track.id);
        }

        for (d, det) in detections.iter().enumerate() {
            if assigned[d].is_some() || det.confidence < self.activation_threshold {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.push(Track {
                id,
                bbox: det.bbox,
                last_seen: timestamp,
            });
            assigned[d] = Some(id);
        }

        let timeout = self.lost_timeout_secs;
        let dropped = &mut self.dropped;
        self.tracks.retain(|track| {
            let keep = timestamp - track.last_seen <= timeout;
            if !keep {
                dropped.push(track.id);
            }
            keep
        });

        assigned
    }

    fn take_dropped(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.dropped)
    }

    fn active_tracks(&self) -> usize {
        self.tracks.len()
    }
}

/// Bounded history of raw class observations for one identity.
#[derive(Clone, Debug)]
pub struct ClassHistory {
    observations: VecDeque<VehicleType>,
    capacity: usize,
}

impl ClassHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            observations: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, vehicle_type: VehicleType) {
        if self.observations.len() == self.capacity {
            self.observations.pop_front();
        }
        self.observations.push_back(vehicle_type);
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Most frequent class. An even split goes to the class observed most recently.
    pub fn majority(&self) -> Option<VehicleType> {
        majority_vote(self.observations.iter().copied())
    }
}

/// Statistical mode of `observations`; ties resolve to the latest tied value.
pub fn majority_vote<I>(observations: I) -> Option<VehicleType>
where
    I: IntoIterator<Item = VehicleType>,
{
    let mut counts: BTreeMap<VehicleType, (usize, usize)> = BTreeMap::new();
    for (position, vehicle_type) in observations.into_iter().enumerate() {
        let entry = counts.entry(vehicle_type).or_insert((0, 0));
        entry.0 += 1;
        entry.1 = position;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then_with(|| a.1 .1.cmp(&b.1 .1)))
        .map(|(vehicle_type, _)| vehicle_type)
}

/// Assigns stable string ids and stable class labels to detections.
///
/// Owned by a single processing worker; class and track state is never shared.
pub struct IdentityTracker {
    tracker: Box<dyn Tracker>,
    histories: HashMap<u64, ClassHistory>,
    history_len: usize,
}

impl IdentityTracker {
    pub fn new(settings: &TrackerSettings) -> Self {
        Self::with_tracker(Box::new(IouTracker::new(settings)), settings.class_history_len)
    }

    pub fn with_tracker(tracker: Box<dyn Tracker>, history_len: usize) -> Self {
        Self {
            tracker,
            histories: HashMap::new(),
            history_len,
        }
    }

    /// Assign ids in place. Detections that do not map to a track are removed;
    /// `raw_detection_count` keeps the detector's original count.
    pub fn update(&mut self, analysis: &mut FrameAnalysis) {
        let assignments = self.tracker.update(&analysis.vehicles, analysis.timestamp);
        analysis.raw_detection_count = analysis.vehicles.len();

        let history_len = self.history_len;
        let vehicles = std::mem::take(&mut analysis.vehicles);
        for (mut vehicle, track_id) in vehicles.into_iter().zip(assignments) {
            let Some(track_id) = track_id else {
                continue;
            };
            let history = self
                .histories
                .entry(track_id)
                .or_insert_with(|| ClassHistory::new(history_len));
            history.push(vehicle.vehicle_type);
            if let Some(stable) = history.majority() {
                vehicle.vehicle_type = stable;
            }
            vehicle.id = track_id.to_string();
            analysis.vehicles.push(vehicle);
        }
        analysis.total_count = analysis.vehicles.len();

        for dropped in self.tracker.take_dropped() {
            self.histories.remove(&dropped);
        }
    }

    pub fn stable_class(&self, track_id: u64) -> Option<VehicleType> {
        self.histories.get(&track_id).and_then(ClassHistory::majority)
    }

    pub fn active_tracks(&self) -> usize {
        self.tracker.active_tracks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle(vehicle_type: VehicleType, x: f32, confidence: f32) -> DetectedVehicle {
        DetectedVehicle::new(
            vehicle_type,
            confidence,
            BBox::new(x, 0.0, x + 40.0, 40.0),
            0.0,
        )
    }

    fn frame(id: u64, timestamp: f64, vehicles: Vec<DetectedVehicle>) -> FrameAnalysis {
        FrameAnalysis::new(id, timestamp, vehicles)
    }

    #[test]
    fn majority_of_car_car_truck_is_car() {
        let mut history = ClassHistory::new(30);
        for t in [VehicleType::Car, VehicleType::Car, VehicleType::Truck] {
            history.push(t);
        }
        assert_eq!(history.majority(), Some(VehicleType::Car));
    }

    #[test]
    fn even_split_prefers_most_recent() {
        let votes = [VehicleType::Truck, VehicleType::Car, VehicleType::Car, VehicleType::Truck];
        assert_eq!(majority_vote(votes), Some(VehicleType::Truck));
        let votes = [VehicleType::Truck, VehicleType::Car];
        assert_eq!(majority_vote(votes), Some(VehicleType::Car));
        assert_eq!(majority_vote(Vec::new()), None);
    }

    #[test]
    fn history_is_bounded() {
        let mut history = ClassHistory::new(3);
        for t in [VehicleType::Bus, VehicleType::Bus, VehicleType::Car, VehicleType::Car, VehicleType::Car] {
            history.push(t);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.majority(), Some(VehicleType::Car));
    }

    #[test]
    fn overlapping_boxes_keep_their_id_and_stable_class() {
        let mut tracker = IdentityTracker::new(&TrackerSettings::default());

        let mut a = frame(0, 0.0, vec![vehicle(VehicleType::Car, 0.0, 0.9)]);
        tracker.update(&mut a);
        let mut b = frame(1, 0.1, vec![vehicle(VehicleType::Car, 2.0, 0.9)]);
        tracker.update(&mut b);
        let mut c = frame(2, 0.2, vec![vehicle(VehicleType::Truck, 4.0, 0.9)]);
        tracker.update(&mut c);

        assert_eq!(a.vehicles[0].id, "1");
        assert_eq!(c.vehicles[0].id, "1");
        assert_eq!(c.vehicles[0].vehicle_type, VehicleType::Car);
        assert_eq!(tracker.stable_class(1), Some(VehicleType::Car));
    }

    #[test]
    fn low_confidence_detections_do_not_start_tracks() {
        let mut tracker = IdentityTracker::new(&TrackerSettings::default());
        let mut analysis = frame(
            0,
            0.0,
            vec![vehicle(VehicleType::Car, 0.0, 0.9), vehicle(VehicleType::Bus, 200.0, 0.05)],
        );
        tracker.update(&mut analysis);
        assert_eq!(analysis.raw_detection_count, 2);
        assert_eq!(analysis.total_count, 1);
        assert_eq!(analysis.vehicles[0].vehicle_type, VehicleType::Car);
    }

    #[test]
    fn lost_ids_are_never_reused() {
        let settings = TrackerSettings {
            lost_timeout_secs: 1.0,
            ..TrackerSettings::default()
        };
        let mut tracker = IdentityTracker::new(&settings);
        let mut first = frame(0, 0.0, vec![vehicle(VehicleType::Car, 0.0, 0.9)]);
        tracker.update(&mut first);

        let mut gap = frame(1, 5.0, Vec::new());
        tracker.update(&mut gap);
        assert_eq!(tracker.active_tracks(), 0);
        assert_eq!(tracker.stable_class(1), None);

        let mut again = frame(2, 5.1, vec![vehicle(VehicleType::Car, 0.0, 0.9)]);
        tracker.update(&mut again);
        assert_eq!(again.vehicles[0].id, "2");
    }

    #[test]
    fn greedy_matching_prefers_highest_overlap() {
        let mut tracker = IouTracker::new(&TrackerSettings::default());
        let first = vec![vehicle(VehicleType::Car, 0.0, 0.9), vehicle(VehicleType::Car, 30.0, 0.9)];
        assert_eq!(tracker.update(&first, 0.0), vec![Some(1), Some(2)]);
        // Second vehicle moved to x=32, first to x=1; order swapped in the detector output.
        let second = vec![vehicle(VehicleType::Car, 32.0, 0.9), vehicle(VehicleType::Car, 1.0, 0.9)];
        assert_eq!(tracker.update(&second, 0.1), vec![Some(2), Some(1)]);
    }
}
