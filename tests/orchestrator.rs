use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tempfile::tempdir;

use traffic_vision::config::PersistenceSettings;
use traffic_vision::detect::DetectorRegistry;
use traffic_vision::ingest::SourceRegistry;
use traffic_vision::storage::SqliteTrafficRepository;
use traffic_vision::zones::ZoneConfig;
use traffic_vision::{CameraBuilder, CameraOrchestrator, CameraSettings};

fn orchestrator(persistence: PersistenceSettings) -> CameraOrchestrator {
    let builder = CameraBuilder::new(
        Arc::new(SourceRegistry::with_defaults()),
        Arc::new(DetectorRegistry::with_defaults()),
    )
    .with_persistence_defaults(persistence);
    CameraOrchestrator::new(builder).with_broadcast_interval(Duration::from_millis(50))
}

fn memory_persistence() -> PersistenceSettings {
    PersistenceSettings {
        kind: "memory".to_string(),
        background: false,
        ..PersistenceSettings::default()
    }
}

fn camera(frames: u32) -> CameraSettings {
    let mut settings = CameraSettings::new("", &format!("stub://cam?frames={}", frames), "synthetic");
    settings.width = Some(64);
    settings.height = Some(48);
    settings.source_fps = 100;
    settings.zones.push(ZoneConfig {
        zone_id: "lane".to_string(),
        polygon: vec![[0.0, 0.0], [64.0, 0.0], [64.0, 48.0], [0.0, 48.0]],
        camera_id: None,
        street: Some("Main St".to_string()),
    });
    settings
}

fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn finite_camera_runs_to_end_of_stream() -> Result<()> {
    let orchestrator = orchestrator(memory_persistence());
    orchestrator.add_camera("cam1", camera(20))?;
    let subscription = orchestrator.broadcaster().subscribe("cam1");

    orchestrator.start_camera("cam1")?;
    let message = subscription
        .recv_timeout(Duration::from_secs(5))?
        .expect("analysis message broadcast");
    assert_eq!(message.camera_id, "cam1");
    assert_eq!(message.zones.len(), 1);
    assert_eq!(message.zones[0].zone_id, "lane");

    assert!(wait_until(Duration::from_secs(10), || {
        !orchestrator.is_running("cam1").unwrap_or(true)
    }));
    let status = orchestrator.camera_status("cam1")?;
    assert!(!status.running);
    assert!(status.last_error.is_none());
    assert_eq!(status.frames_delivered, status.metrics.frames_processed);
    assert_eq!(
        status.metrics.frames_processed + status.metrics.frames_skipped,
        20
    );
    assert!(orchestrator.latest_frame("cam1", false)?.is_some());
    let processed = orchestrator
        .latest_frame("cam1", true)?
        .expect("annotated frame cached");
    assert_eq!(processed.dimensions(), (64, 48));
    assert!(orchestrator.broadcaster().latest("cam1").is_some());
    Ok(())
}

#[test]
fn cameras_restart_after_stop() -> Result<()> {
    let orchestrator = orchestrator(memory_persistence());
    orchestrator.add_camera("live", camera(100_000))?;

    orchestrator.start_camera("live")?;
    assert!(orchestrator.is_running("live")?);
    assert!(wait_until(Duration::from_secs(5), || {
        orchestrator
            .camera_status("live")
            .map(|s| s.frames_delivered > 0)
            .unwrap_or(false)
    }));
    orchestrator.stop_camera("live")?;
    assert!(!orchestrator.is_running("live")?);

    orchestrator.start_camera("live")?;
    assert!(orchestrator.is_running("live")?);
    orchestrator.stop_all()?;
    assert!(!orchestrator.is_running("live")?);
    Ok(())
}

#[test]
fn camera_stopped_before_first_start_can_start() -> Result<()> {
    let orchestrator = orchestrator(memory_persistence());
    orchestrator.add_camera("idle", camera(100_000))?;
    orchestrator.stop_camera("idle")?;

    orchestrator.start_camera("idle")?;
    assert!(orchestrator.is_running("idle")?);
    assert!(wait_until(Duration::from_secs(5), || {
        orchestrator
            .camera_status("idle")
            .map(|s| s.frames_delivered > 0)
            .unwrap_or(false)
    }));
    let status = orchestrator.camera_status("idle")?;
    assert!(status.running);
    assert!(status.last_error.is_none());
    orchestrator.stop_camera("idle")?;
    Ok(())
}

#[test]
fn broadcasts_once_per_interval_but_caches_every_frame() -> Result<()> {
    let builder = CameraBuilder::new(
        Arc::new(SourceRegistry::with_defaults()),
        Arc::new(DetectorRegistry::with_defaults()),
    )
    .with_persistence_defaults(memory_persistence());
    let orchestrator =
        CameraOrchestrator::new(builder).with_broadcast_interval(Duration::from_secs(60));
    orchestrator.add_camera("cam1", camera(15))?;
    let subscription = orchestrator.broadcaster().subscribe("cam1");

    orchestrator.start_camera("cam1")?;
    assert!(wait_until(Duration::from_secs(10), || {
        !orchestrator.is_running("cam1").unwrap_or(true)
    }));

    let status = orchestrator.camera_status("cam1")?;
    assert!(status.frames_delivered > 1);
    assert_eq!(status.frames_delivered, status.metrics.frames_processed);
    assert!(subscription.try_recv().is_some());
    assert_eq!(subscription.try_recv(), None);
    assert!(orchestrator.latest_frame("cam1", false)?.is_some());
    assert!(orchestrator.latest_frame("cam1", true)?.is_some());
    Ok(())
}

#[test]
fn cameras_are_isolated() -> Result<()> {
    let orchestrator = orchestrator(memory_persistence());
    orchestrator.add_camera("ok", camera(100_000))?;
    let mut broken = camera(100_000);
    broken.source = "/definitely/not/a/dir".to_string();
    broken.source_type = "images".to_string();
    assert!(orchestrator.add_camera("broken", broken).is_err());

    orchestrator.start_all()?;
    assert!(orchestrator.is_running("ok")?);
    assert_eq!(orchestrator.camera_ids(), vec!["ok".to_string()]);
    orchestrator.remove_camera("ok")?;
    assert!(orchestrator.camera_ids().is_empty());
    Ok(())
}

#[test]
fn stopping_flushes_aggregates_to_sqlite() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("traffic.db");
    let orchestrator = orchestrator(PersistenceSettings {
        kind: "sqlite".to_string(),
        path: db_path.clone(),
        window_secs: 3_600.0,
        background: true,
        ..PersistenceSettings::default()
    });
    orchestrator.add_camera("cam1", camera(10))?;
    orchestrator.start_camera("cam1")?;
    assert!(wait_until(Duration::from_secs(10), || {
        !orchestrator.is_running("cam1").unwrap_or(true)
    }));
    orchestrator.stop_camera("cam1")?;

    let repository = SqliteTrafficRepository::open(&db_path.to_string_lossy())?;
    let records = repository.read_recent(10)?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].zone_id, "lane");
    assert_eq!(records[0].camera_id, "cam1");
    assert_eq!(records[0].street_monitored, "Main St");
    Ok(())
}
