//! Two-stage capture/processing pipeline for a single frame source.
//!
//! The capture worker pulls frames from a [`FrameProducer`] into a bounded
//! frame queue; the processing worker runs each accepted frame through a
//! [`ProcessorChain`] and pushes `(frame, analysis)` pairs into a bounded
//! result queue. Both queue puts block (with a short retry loop that watches
//! the stop flag), so a slow stage stalls the stage before it instead of
//! growing memory. The consumer side is [`FramePipeline::run`], which
//! pre-buffers, paces output and yields pairs in strictly increasing frame id
//! order.
//!
//! End of stream needs no flag: when capture exits it drops its queue sender,
//! processing drains what is left, finishes the chain and drops its own sender,
//! and the consumer's iterator ends once the result queue is empty.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::frame::Frame;
use crate::ingest::FrameProducer;
use crate::join_bounded;
use crate::metrics::PipelineMetrics;
use crate::model::FrameAnalysis;
use crate::processor::{DetectionErrorPolicy, ProcessorChain};

/// Log one congestion warning per this many skipped frames.
const CONGESTION_LOG_EVERY: u64 = 30;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub frame_queue_size: usize,
    pub result_queue_size: usize,
    /// Results to accumulate before the consumer yields the first one.
    pub min_prebuffer: usize,
    /// Output rate of `run()`; 0 disables pacing.
    pub target_fps: f64,
    pub mild_lag_secs: f64,
    pub severe_lag_secs: f64,
    pub stop_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub on_detection_error: DetectionErrorPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_queue_size: 10,
            result_queue_size: 30,
            min_prebuffer: 5,
            target_fps: 0.0,
            mild_lag_secs: 1.5,
            severe_lag_secs: 2.5,
            stop_timeout_ms: 2000,
            poll_interval_ms: 100,
            on_detection_error: DetectionErrorPolicy::Skip,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frame_queue_size == 0 || self.result_queue_size == 0 {
            return Err(crate::error::VisionError::config("pipeline queue sizes must be > 0").into());
        }
        if !self.target_fps.is_finite() || self.target_fps < 0.0 {
            return Err(crate::error::VisionError::config(format!(
                "target_fps must be >= 0, got {}",
                self.target_fps
            ))
            .into());
        }
        if !(self.mild_lag_secs > 0.0 && self.severe_lag_secs >= self.mild_lag_secs) {
            return Err(crate::error::VisionError::config(format!(
                "catch-up thresholds must satisfy 0 < mild ({}) <= severe ({})",
                self.mild_lag_secs, self.severe_lag_secs
            ))
            .into());
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn frame_budget(&self) -> Option<Duration> {
        (self.target_fps > 0.0).then(|| Duration::from_secs_f64(1.0 / self.target_fps))
    }
}

/// Catch-up skipping decision for the processing worker.
///
/// Above the severe threshold one frame in three is processed, above the mild
/// threshold one in two, otherwise every frame. The stride counter restarts
/// whenever the lag recovers.
#[derive(Clone, Debug)]
pub struct CatchUp {
    mild_lag_secs: f64,
    severe_lag_secs: f64,
    counter: u64,
}

impl CatchUp {
    pub fn new(mild_lag_secs: f64, severe_lag_secs: f64) -> Self {
        Self {
            mild_lag_secs,
            severe_lag_secs,
            counter: 0,
        }
    }

    pub fn stride(&self, lag_secs: f64) -> u64 {
        if lag_secs > self.severe_lag_secs {
            3
        } else if lag_secs > self.mild_lag_secs {
            2
        } else {
            1
        }
    }

    pub fn should_process(&mut self, lag_secs: f64) -> bool {
        let stride = self.stride(lag_secs);
        if stride == 1 {
            self.counter = 0;
            return true;
        }
        let take = self.counter % stride == 0;
        self.counter += 1;
        take
    }
}

/// Owns the frame source so it is released exactly once, whether the capture
/// worker exits on its own or `stop()` gets there first.
struct SourceHandle {
    inner: Mutex<Box<dyn FrameProducer>>,
    released: AtomicBool,
    cancel: Option<Arc<AtomicBool>>,
    description: String,
}

impl SourceHandle {
    fn new(source: Box<dyn FrameProducer>) -> Self {
        Self {
            description: source.describe(),
            cancel: source.cancel_token(),
            inner: Mutex::new(source),
            released: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn FrameProducer>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_frame(&self) -> Result<Option<Frame>> {
        let mut source = self.lock();
        if self.released.load(Ordering::SeqCst) {
            return Ok(None);
        }
        source.next_frame()
    }

    fn cancel(&self) {
        if let Some(cancel) = &self.cancel {
            cancel.store(true, Ordering::SeqCst);
        }
    }

    fn release_locked(&self, source: &mut Box<dyn FrameProducer>) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        source.release();
        log::debug!("pipeline: released source {}", self.description);
        true
    }

    /// Blocking release used by the capture worker on exit.
    fn release(&self) -> bool {
        let mut source = self.lock();
        self.release_locked(&mut source)
    }

    /// Non-blocking release used by `stop()`. Returns false when the capture
    /// worker still holds the source; it releases it when it gets out.
    fn try_release(&self) -> bool {
        match self.inner.try_lock() {
            Ok(mut source) => self.release_locked(&mut source),
            Err(TryLockError::Poisoned(poisoned)) => self.release_locked(&mut poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => false,
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// State shared between the workers and the consumer.
struct Shared {
    stop: AtomicBool,
    latest_capture_bits: AtomicU64,
    capture_done: AtomicBool,
    processing_done: AtomicBool,
    last_error: Mutex<Option<String>>,
    latest: Mutex<Option<FrameAnalysis>>,
    metrics: Arc<PipelineMetrics>,
}

impl Shared {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn set_latest_capture(&self, timestamp: f64) {
        self.latest_capture_bits
            .store(timestamp.to_bits(), Ordering::SeqCst);
    }

    fn latest_capture(&self) -> f64 {
        f64::from_bits(self.latest_capture_bits.load(Ordering::SeqCst))
    }

    fn record_error(&self, message: String) {
        let mut slot = self.last_error.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(message);
    }
}

type Delivery = (Frame, FrameAnalysis);

pub struct FramePipeline {
    label: String,
    config: PipelineConfig,
    source: Arc<SourceHandle>,
    chain: Mutex<Option<ProcessorChain>>,
    shared: Arc<Shared>,
    workers: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    results: Mutex<Option<Receiver<Delivery>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl FramePipeline {
    pub fn new(source: Box<dyn FrameProducer>, mut chain: ProcessorChain, config: PipelineConfig) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        chain.attach_metrics(metrics.clone());
        let source = SourceHandle::new(source);
        Self {
            label: source.description.clone(),
            config,
            source: Arc::new(source),
            chain: Mutex::new(Some(chain)),
            shared: Arc::new(Shared {
                stop: AtomicBool::new(false),
                latest_capture_bits: AtomicU64::new(0f64.to_bits()),
                capture_done: AtomicBool::new(false),
                processing_done: AtomicBool::new(false),
                last_error: Mutex::new(None),
                latest: Mutex::new(None),
                metrics,
            }),
            workers: Mutex::new(Vec::new()),
            results: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn source_description(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.shared.metrics.clone()
    }

    /// Most recent analysis produced by the processing worker.
    pub fn latest_analysis(&self) -> Option<FrameAnalysis> {
        self.shared
            .latest
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Last fatal worker error (source failure, or a detection failure under
    /// the `stop` policy).
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
            && !self.stopped.load(Ordering::SeqCst)
            && !self.shared.processing_done.load(Ordering::SeqCst)
    }

    /// A stopped pipeline can never start again.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Spawn the capture and processing workers. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(anyhow!("pipeline {} already stopped", self.label));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.config.validate()?;
        let chain = self
            .chain
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| anyhow!("pipeline {} has no processor chain", self.label))?;

        let (frame_tx, frame_rx) = bounded::<Frame>(self.config.frame_queue_size);
        let (result_tx, result_rx) = bounded::<Delivery>(self.config.result_queue_size);

        let capture = {
            let source = self.source.clone();
            let shared = self.shared.clone();
            let poll = self.config.poll_interval();
            thread::Builder::new()
                .name(format!("capture:{}", self.label))
                .spawn(move || capture_loop(source, frame_tx, shared, poll))
                .context("spawn capture worker")?
        };
        let processing = {
            let shared = self.shared.clone();
            let config = self.config.clone();
            thread::Builder::new()
                .name(format!("process:{}", self.label))
                .spawn(move || processing_loop(chain, frame_rx, result_tx, shared, config))
                .context("spawn processing worker")?
        };

        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        workers.push(("capture", capture));
        workers.push(("processing", processing));
        *self.results.lock().unwrap_or_else(|p| p.into_inner()) = Some(result_rx);
        log::info!(
            "pipeline {} started (frame queue {}, result queue {})",
            self.label,
            self.config.frame_queue_size,
            self.config.result_queue_size
        );
        Ok(())
    }

    /// Start if needed and hand out the consuming iterator. Only one consumer
    /// may exist; dropping it stops the pipeline.
    pub fn run(&self) -> Result<PipelineRun<'_>> {
        self.start()?;
        let receiver = self
            .results
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| anyhow!("pipeline {} output is already being consumed", self.label))?;
        Ok(PipelineRun {
            pipeline: self,
            receiver,
            prebuffered: false,
            last_yield: None,
            last_frame_id: None,
        })
    }

    /// Signal both workers, join them with a bounded timeout and release the
    /// source. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.stop.store(true, Ordering::SeqCst);
        self.source.cancel();

        let timeout = Duration::from_millis(self.config.stop_timeout_ms);
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for (name, handle) in workers {
            if let Err(err) = join_bounded(handle, timeout) {
                log::warn!("pipeline {}: {} worker abandoned: {:#}", self.label, name, err);
            }
        }

        if !self.source.try_release() && !self.source.is_released() {
            log::warn!(
                "pipeline {}: source busy, capture worker will release it on exit",
                self.label
            );
        }
        log::info!("pipeline {} stopped", self.label);
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Consumer side of a running pipeline.
pub struct PipelineRun<'a> {
    pipeline: &'a FramePipeline,
    receiver: Receiver<Delivery>,
    prebuffered: bool,
    last_yield: Option<Instant>,
    last_frame_id: Option<u64>,
}

impl PipelineRun<'_> {
    fn prebuffer(&mut self) {
        let shared = &self.pipeline.shared;
        let wanted = self
            .pipeline
            .config
            .min_prebuffer
            .min(self.pipeline.config.result_queue_size);
        while self.receiver.len() < wanted
            && !shared.processing_done.load(Ordering::SeqCst)
            && !shared.stopping()
        {
            thread::sleep(Duration::from_millis(5));
        }
        log::debug!(
            "pipeline {}: prebuffered {} results",
            self.pipeline.label,
            self.receiver.len()
        );
        self.prebuffered = true;
    }

    fn pace(&mut self) {
        if let (Some(budget), Some(last)) = (self.pipeline.config.frame_budget(), self.last_yield) {
            let elapsed = last.elapsed();
            if elapsed < budget {
                thread::sleep(budget - elapsed);
            }
        }
        self.last_yield = Some(Instant::now());
    }
}

impl Iterator for PipelineRun<'_> {
    type Item = (Frame, FrameAnalysis);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.prebuffered {
            self.prebuffer();
        }
        let poll = self.pipeline.config.poll_interval();
        loop {
            if self.pipeline.shared.stopping() {
                return None;
            }
            match self.receiver.recv_timeout(poll) {
                Ok((frame, analysis)) => {
                    debug_assert!(self.last_frame_id.map_or(true, |last| frame.id > last));
                    self.last_frame_id = Some(frame.id);
                    self.pace();
                    self.pipeline.shared.metrics.record_delivered();
                    return Some((frame, analysis));
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

impl Drop for PipelineRun<'_> {
    fn drop(&mut self) {
        self.pipeline.stop();
    }
}

/// Blocking put with a retry loop that gives up once `stop` is raised or the
/// receiving side is gone. Returns whether the item was queued.
fn put_blocking<T>(tx: &Sender<T>, mut item: T, stop: &AtomicBool, poll: Duration) -> bool {
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        match tx.send_timeout(item, poll) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => item = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

fn capture_loop(source: Arc<SourceHandle>, tx: Sender<Frame>, shared: Arc<Shared>, poll: Duration) {
    while !shared.stopping() {
        match source.next_frame() {
            Ok(Some(frame)) => {
                shared.set_latest_capture(frame.timestamp);
                shared.metrics.record_captured();
                log::trace!("capture: frame {} at {:.3}", frame.id, frame.timestamp);
                if !put_blocking(&tx, frame, &shared.stop, poll) {
                    break;
                }
            }
            Ok(None) => {
                log::info!("capture: end of stream for {}", source.description);
                break;
            }
            Err(err) => {
                log::error!("capture: source {} failed: {:#}", source.description, err);
                shared.record_error(format!("{:#}", err));
                break;
            }
        }
    }
    drop(tx);
    source.release();
    shared.capture_done.store(true, Ordering::SeqCst);
}

fn processing_loop(
    mut chain: ProcessorChain,
    rx: Receiver<Frame>,
    tx: Sender<Delivery>,
    shared: Arc<Shared>,
    config: PipelineConfig,
) {
    let poll = config.poll_interval();
    let mut catch_up = CatchUp::new(config.mild_lag_secs, config.severe_lag_secs);
    while !shared.stopping() {
        let frame = match rx.recv_timeout(poll) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let lag = shared.latest_capture() - frame.timestamp;
        if !catch_up.should_process(lag) {
            let skipped = shared.metrics.record_skipped();
            if skipped % CONGESTION_LOG_EVERY == 1 {
                log::warn!(
                    "processing: {:.2}s behind capture, skipping frames ({} skipped so far)",
                    lag,
                    skipped
                );
            }
            continue;
        }

        match chain.process(&frame) {
            Ok(analysis) => {
                shared.metrics.record_processed();
                *shared.latest.lock().unwrap_or_else(|p| p.into_inner()) = Some(analysis.clone());
                if !put_blocking(&tx, (frame, analysis), &shared.stop, poll) {
                    break;
                }
            }
            Err(err) => {
                shared.metrics.record_failed();
                match config.on_detection_error {
                    DetectionErrorPolicy::Skip => {
                        log::warn!("processing: frame {} skipped: {:#}", frame.id, err);
                    }
                    DetectionErrorPolicy::Stop => {
                        log::error!("processing: frame {} failed, stopping: {:#}", frame.id, err);
                        shared.record_error(format!("{:#}", err));
                        shared.stop.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
    }
    chain.finish();
    drop(tx);
    shared.processing_done.store(true, Ordering::SeqCst);
}
