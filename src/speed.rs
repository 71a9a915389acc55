//! Per-identity speed estimation from bounding-box motion.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::model::BBox;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedSettings {
    pub enabled: bool,
    /// Fixed per-camera calibration.
    pub pixels_per_meter: f32,
    pub window_secs: f64,
    /// Oldest and newest samples must be at least this far apart.
    pub min_span_secs: f64,
}

impl Default for SpeedSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            pixels_per_meter: 10.0,
            window_secs: 1.0,
            min_span_secs: 0.1,
        }
    }
}

pub trait SpeedEstimator: Send {
    /// Record a sample for `track_id` and return the current estimate in km/h.
    fn update(&mut self, track_id: &str, bbox: &BBox, timestamp: f64) -> Option<f32>;

    /// Drop state for identities with no sample in the trailing window
    /// ending at `now`. Brief detection gaps keep their history.
    fn prune(&mut self, now: f64);
}

/// Trailing-window estimator over the bottom edge of the box.
///
/// Uses the oldest and newest retained samples:
/// `speed_kmh = |dy_px| / pixels_per_meter / dt * 3.6`.
pub struct WindowedSpeedEstimator {
    pixels_per_meter: f32,
    window_secs: f64,
    min_span_secs: f64,
    samples: HashMap<String, VecDeque<(f64, f32)>>,
}

impl WindowedSpeedEstimator {
    pub fn new(settings: &SpeedSettings) -> Self {
        Self {
            pixels_per_meter: settings.pixels_per_meter,
            window_secs: settings.window_secs,
            min_span_secs: settings.min_span_secs,
            samples: HashMap::new(),
        }
    }

    pub fn tracked(&self) -> usize {
        self.samples.len()
    }
}

impl SpeedEstimator for WindowedSpeedEstimator {
    fn update(&mut self, track_id: &str, bbox: &BBox, timestamp: f64) -> Option<f32> {
        if track_id.is_empty() {
            return None;
        }
        let window = self.samples.entry(track_id.to_string()).or_default();
        window.push_back((timestamp, bbox.bottom_center().1));
        while let Some(&(t, _)) = window.front() {
            if timestamp - t > self.window_secs {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() < 2 {
            return None;
        }
        let (t1, y1) = *window.front()?;
        let (t2, y2) = *window.back()?;
        let span = t2 - t1;
        if span <= 0.0 || span < self.min_span_secs || self.pixels_per_meter <= 0.0 {
            return None;
        }
        let meters = (y2 - y1).abs() / self.pixels_per_meter;
        Some((meters as f64 / span * 3.6) as f32)
    }

    fn prune(&mut self, now: f64) {
        let window_secs = self.window_secs;
        self.samples
            .retain(|_, window| matches!(window.back(), Some(&(t, _)) if now - t <= window_secs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox_at(y2: f32) -> BBox {
        BBox::new(0.0, y2 - 20.0, 20.0, y2)
    }

    #[test]
    fn needs_two_samples() {
        let mut estimator = WindowedSpeedEstimator::new(&SpeedSettings::default());
        assert_eq!(estimator.update("1", &bbox_at(100.0), 0.0), None);
        // 50 px in 0.5 s at 10 px/m = 10 m/s = 36 km/h
        let speed = estimator.update("1", &bbox_at(150.0), 0.5).unwrap();
        assert!((speed - 36.0).abs() < 1e-3);
    }

    #[test]
    fn old_samples_fall_out_of_the_window() {
        let mut estimator = WindowedSpeedEstimator::new(&SpeedSettings::default());
        estimator.update("1", &bbox_at(0.0), 0.0);
        estimator.update("1", &bbox_at(500.0), 0.5);
        // t=0 is evicted at t=1.4; the remaining 0.9 s span covers 10 px.
        let speed = estimator.update("1", &bbox_at(510.0), 1.4).unwrap();
        assert!((speed - 4.0).abs() < 1e-3);
    }

    #[test]
    fn tiny_spans_and_empty_ids_are_ignored() {
        let mut estimator = WindowedSpeedEstimator::new(&SpeedSettings::default());
        assert_eq!(estimator.update("", &bbox_at(10.0), 0.0), None);
        estimator.update("1", &bbox_at(10.0), 0.0);
        assert_eq!(estimator.update("1", &bbox_at(20.0), 0.05), None);
    }

    #[test]
    fn prune_drops_ids_idle_past_the_window() {
        let mut estimator = WindowedSpeedEstimator::new(&SpeedSettings::default());
        estimator.update("1", &bbox_at(10.0), 0.0);
        estimator.update("2", &bbox_at(10.0), 0.8);
        estimator.prune(1.5);
        assert_eq!(estimator.tracked(), 1);
        estimator.prune(2.0);
        assert_eq!(estimator.tracked(), 0);
    }

    #[test]
    fn one_missed_frame_keeps_the_history() {
        let mut estimator = WindowedSpeedEstimator::new(&SpeedSettings::default());
        assert_eq!(estimator.update("1", &bbox_at(100.0), 0.0), None);
        // Not detected at t=0.2.
        estimator.prune(0.2);
        // 40 px in 0.4 s at 10 px/m = 10 m/s = 36 km/h
        let speed = estimator.update("1", &bbox_at(140.0), 0.4).unwrap();
        assert!((speed - 36.0).abs() < 1e-3);
    }
}
