//! Per-frame processing chain.
//!
//! Detection, then tracking, speed, zones and aggregation, each a
//! `FrameProcessor` stage operating on a shared `FrameContext`. The chain is
//! owned by one processing worker, so stages hold plain mutable state.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::aggregate::TrafficAggregator;
use crate::detect::Detector;
use crate::error::VisionError;
use crate::frame::Frame;
use crate::metrics::PipelineMetrics;
use crate::model::FrameAnalysis;
use crate::speed::SpeedEstimator;
use crate::tracking::IdentityTracker;
use crate::zones::SharedZones;

/// What the processing worker does when detection fails on a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionErrorPolicy {
    /// Log, count, drop the frame and keep going.
    #[default]
    Skip,
    /// End the pipeline; the camera reports the error in its status.
    Stop,
}

pub struct FrameContext<'a> {
    pub frame: &'a Frame,
    pub analysis: FrameAnalysis,
    /// False when `analysis` is a reused result from an earlier frame.
    pub fresh: bool,
}

pub trait FrameProcessor: Send {
    fn name(&self) -> &'static str;

    fn process(&mut self, ctx: &mut FrameContext<'_>) -> Result<()>;

    /// Called once when the pipeline shuts down.
    fn finish(&mut self) {}

    fn attach_metrics(&mut self, _metrics: Arc<PipelineMetrics>) {}
}

pub struct TrackingStage {
    tracker: IdentityTracker,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl TrackingStage {
    pub fn new(tracker: IdentityTracker) -> Self {
        Self {
            tracker,
            metrics: None,
        }
    }
}

impl FrameProcessor for TrackingStage {
    fn name(&self) -> &'static str {
        "tracking"
    }

    fn process(&mut self, ctx: &mut FrameContext<'_>) -> Result<()> {
        if !ctx.fresh {
            return Ok(());
        }
        let started = Instant::now();
        self.tracker.update(&mut ctx.analysis);
        if let Some(metrics) = &self.metrics {
            metrics.record_tracking(started.elapsed());
        }
        Ok(())
    }

    fn attach_metrics(&mut self, metrics: Arc<PipelineMetrics>) {
        self.metrics = Some(metrics);
    }
}

pub struct SpeedStage {
    estimator: Box<dyn SpeedEstimator>,
}

impl SpeedStage {
    pub fn new(estimator: Box<dyn SpeedEstimator>) -> Self {
        Self { estimator }
    }
}

impl FrameProcessor for SpeedStage {
    fn name(&self) -> &'static str {
        "speed"
    }

    fn process(&mut self, ctx: &mut FrameContext<'_>) -> Result<()> {
        if !ctx.fresh {
            return Ok(());
        }
        let timestamp = ctx.analysis.timestamp;
        for vehicle in ctx.analysis.vehicles.iter_mut() {
            vehicle.speed = self.estimator.update(&vehicle.id, &vehicle.bbox, timestamp);
        }
        self.estimator.prune(timestamp);
        Ok(())
    }
}

pub struct ZoneStage {
    zones: SharedZones,
}

impl ZoneStage {
    pub fn new(zones: SharedZones) -> Self {
        Self { zones }
    }
}

impl FrameProcessor for ZoneStage {
    fn name(&self) -> &'static str {
        "zones"
    }

    fn process(&mut self, ctx: &mut FrameContext<'_>) -> Result<()> {
        if !ctx.fresh {
            return Ok(());
        }
        let counter = match self.zones.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ctx.analysis.zones = counter.count(&ctx.analysis.vehicles, ctx.analysis.timestamp);
        Ok(())
    }
}

pub struct AggregationStage {
    aggregator: TrafficAggregator,
}

impl AggregationStage {
    pub fn new(aggregator: TrafficAggregator) -> Self {
        Self { aggregator }
    }
}

impl FrameProcessor for AggregationStage {
    fn name(&self) -> &'static str {
        "aggregation"
    }

    fn process(&mut self, ctx: &mut FrameContext<'_>) -> Result<()> {
        self.aggregator.aggregate_and_persist(&ctx.analysis);
        Ok(())
    }

    fn finish(&mut self) {
        let records = self.aggregator.force_flush();
        log::info!("aggregation: final flush wrote {} zone records", records.len());
    }
}

/// Detector plus ordered stages.
///
/// The detector runs on frames whose id is a multiple of `detect_every_n`;
/// other frames reuse the last fully processed analysis. Reused analyses skip
/// tracking, speed and zones but are still aggregated.
pub struct ProcessorChain {
    detector: Box<dyn Detector>,
    stages: Vec<Box<dyn FrameProcessor>>,
    detect_every_n: u64,
    last: Option<FrameAnalysis>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl ProcessorChain {
    pub fn new(detector: Box<dyn Detector>, detect_every_n: u64) -> Self {
        Self {
            detector,
            stages: Vec::new(),
            detect_every_n: detect_every_n.max(1),
            last: None,
            metrics: None,
        }
    }

    pub fn with_stage<P: FrameProcessor + 'static>(mut self, stage: P) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Tracking → speed (optional) → zones → aggregation (optional).
    pub fn standard(
        detector: Box<dyn Detector>,
        detect_every_n: u64,
        tracker: IdentityTracker,
        speed: Option<Box<dyn SpeedEstimator>>,
        zones: SharedZones,
        aggregator: Option<TrafficAggregator>,
    ) -> Self {
        let mut chain = Self::new(detector, detect_every_n).with_stage(TrackingStage::new(tracker));
        if let Some(estimator) = speed {
            chain = chain.with_stage(SpeedStage::new(estimator));
        }
        chain = chain.with_stage(ZoneStage::new(zones));
        if let Some(aggregator) = aggregator {
            chain = chain.with_stage(AggregationStage::new(aggregator));
        }
        chain
    }

    pub fn attach_metrics(&mut self, metrics: Arc<PipelineMetrics>) {
        for stage in self.stages.iter_mut() {
            stage.attach_metrics(metrics.clone());
        }
        self.metrics = Some(metrics);
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn process(&mut self, frame: &Frame) -> Result<FrameAnalysis> {
        let reuse = frame.id % self.detect_every_n != 0 && self.last.is_some();
        let mut ctx = match (&self.last, reuse) {
            (Some(last), true) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_reused();
                }
                FrameContext {
                    frame,
                    analysis: last.clone(),
                    fresh: false,
                }
            }
            _ => {
                let started = Instant::now();
                let analysis = self
                    .detector
                    .detect(&frame.image, frame.id, frame.timestamp)
                    .map_err(|err| match err.downcast::<VisionError>() {
                        Ok(typed @ VisionError::Detection { .. }) => anyhow::Error::new(typed),
                        Ok(other) => VisionError::detection(frame.id, other.to_string()).into(),
                        Err(err) => VisionError::detection(frame.id, format!("{:#}", err)).into(),
                    })?;
                if let Some(metrics) = &self.metrics {
                    metrics.record_detection(started.elapsed());
                }
                FrameContext {
                    frame,
                    analysis,
                    fresh: true,
                }
            }
        };

        for stage in self.stages.iter_mut() {
            stage.process(&mut ctx)?;
        }
        if ctx.fresh {
            self.last = Some(ctx.analysis.clone());
        }
        Ok(ctx.analysis)
    }

    pub fn finish(&mut self) {
        for stage in self.stages.iter_mut() {
            stage.finish();
        }
    }
}
