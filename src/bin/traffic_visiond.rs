//! traffic_visiond - multi-camera traffic analysis daemon
//!
//! This daemon:
//! 1. Loads the application config (file + environment)
//! 2. Builds the source and detector registries
//! 3. Adds and starts every configured camera
//! 4. Serves the status/control/streaming API
//! 5. On Ctrl-C stops all cameras, flushing their aggregation windows

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use traffic_vision::{
    api::{ApiConfig, ApiServer},
    detect::DetectorRegistry,
    ingest::SourceRegistry,
    AppConfig, CameraBuilder, CameraOrchestrator,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "TRAFFIC_CONFIG")]
    config: Option<PathBuf>,
    /// Register cameras but do not start them.
    #[arg(long)]
    no_autostart: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = AppConfig::load_from(args.config.as_deref())?;

    let sources = SourceRegistry::with_defaults();
    let detectors = DetectorRegistry::with_defaults();
    log::info!(
        "sources: {:?}; detector backends: {:?}",
        sources.list(),
        detectors.list()
    );
    let builder = CameraBuilder::new(Arc::new(sources), Arc::new(detectors))
        .with_detector_defaults(config.detector.clone())
        .with_persistence_defaults(config.persistence.clone());
    let orchestrator = Arc::new(
        CameraOrchestrator::new(builder).with_broadcast_interval(config.broadcast_interval),
    );

    for camera in &config.cameras {
        orchestrator.add_camera(&camera.camera_id, camera.clone())?;
    }
    if !args.no_autostart {
        if let Err(err) = orchestrator.start_all() {
            log::error!("not every camera started: {:#}", err);
        }
    }

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        ..ApiConfig::default()
    };
    let api_handle = ApiServer::new(api_config, orchestrator.clone()).spawn()?;
    log::info!(
        "traffic_visiond running: {} cameras, api on {}",
        config.cameras.len(),
        api_handle.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping cameras...");

    if let Err(err) = orchestrator.stop_all() {
        log::warn!("shutdown: {:#}", err);
    }
    api_handle.stop()?;
    log::info!("traffic_visiond stopped");
    Ok(())
}
