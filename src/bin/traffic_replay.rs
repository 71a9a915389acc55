//! traffic_replay - headless single-source run
//!
//! Runs one camera pipeline without the API or any display, logging a short
//! summary every N delivered frames and the final counters at the end.

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use traffic_vision::{
    config::PersistenceSettings,
    detect::{DetectorRegistry, DetectorSettings},
    ingest::SourceRegistry,
    zones::ZoneConfig,
    CameraBuilder, CameraSettings,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Source URI or path (e.g. `stub://demo?frames=300`, an image directory).
    #[arg(long, default_value = "stub://replay?frames=300")]
    source: String,
    /// Source kind: synthetic, stream, images.
    #[arg(long, default_value = "synthetic")]
    source_type: String,
    /// Detector backend name (synthetic, replay).
    #[arg(long, default_value = "")]
    detector: String,
    /// JSON-lines detections for the replay backend.
    #[arg(long)]
    detections: Option<PathBuf>,
    /// JSON file with an array of zone definitions.
    #[arg(long)]
    zones: Option<PathBuf>,
    /// SQLite database for aggregated records.
    #[arg(long, conflicts_with = "csv_dir")]
    db: Option<PathBuf>,
    /// Directory for daily CSV files.
    #[arg(long)]
    csv_dir: Option<PathBuf>,
    /// Aggregation window in seconds.
    #[arg(long, default_value_t = 60.0)]
    window_secs: f64,
    #[arg(long, default_value_t = 1)]
    detect_every_n: u64,
    /// Stop after this many delivered frames.
    #[arg(long)]
    max_frames: Option<u64>,
    /// Log a summary every N frames.
    #[arg(long, default_value_t = 30)]
    log_every: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let zones: Vec<ZoneConfig> = match &args.zones {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read zones file {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parse zones file {}", path.display()))?
        }
        None => Vec::new(),
    };

    let persistence = match (&args.db, &args.csv_dir) {
        (Some(db), _) => PersistenceSettings {
            kind: "sqlite".to_string(),
            path: db.clone(),
            ..PersistenceSettings::default()
        },
        (None, Some(dir)) => PersistenceSettings {
            kind: "csv".to_string(),
            path: dir.clone(),
            ..PersistenceSettings::default()
        },
        (None, None) => PersistenceSettings {
            kind: "memory".to_string(),
            ..PersistenceSettings::default()
        },
    };

    let mut camera = CameraSettings::new("replay", &args.source, &args.source_type);
    camera.zones = zones;
    camera.inject_camera_id();
    camera.performance.detect_every_n = args.detect_every_n;
    camera.detector = Some(DetectorSettings {
        backend: args.detector.clone(),
        replay_path: args.detections.clone(),
        ..DetectorSettings::default()
    });
    camera.persistence = Some(PersistenceSettings {
        window_secs: args.window_secs,
        background: false,
        ..persistence
    });

    let builder = CameraBuilder::new(
        Arc::new(SourceRegistry::with_defaults()),
        Arc::new(DetectorRegistry::with_defaults()),
    );
    let built = builder.build(&camera)?;
    let pipeline = built.pipeline;
    log::info!("replaying {}", pipeline.source_description());

    let mut delivered = 0u64;
    let mut vehicles_seen = 0usize;
    for (frame, analysis) in pipeline.run()? {
        delivered += 1;
        vehicles_seen += analysis.total_count;
        if args.log_every > 0 && delivered % args.log_every == 0 {
            let per_zone: BTreeMap<&str, usize> = analysis
                .zones
                .iter()
                .map(|z| (z.zone_id.as_str(), z.vehicle_count))
                .collect();
            log::info!(
                "frame {}: {} vehicles, zones {:?}",
                frame.id,
                analysis.total_count,
                per_zone
            );
        }
        if args.max_frames.is_some_and(|max| delivered >= max) {
            break;
        }
    }
    pipeline.stop();

    let metrics = pipeline.metrics().snapshot();
    log::info!(
        "done: {} frames delivered, {} processed, {} skipped, {} failed, {} vehicle observations",
        delivered,
        metrics.frames_processed,
        metrics.frames_skipped,
        metrics.frames_failed,
        vehicles_seen
    );
    if let Some(err) = pipeline.last_error() {
        log::warn!("source ended with error: {}", err);
    }
    Ok(())
}
