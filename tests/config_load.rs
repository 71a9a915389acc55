use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use traffic_vision::error::classify;
use traffic_vision::{AppConfig, VisionError};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "TRAFFIC_CONFIG",
        "TRAFFIC_API_ADDR",
        "TRAFFIC_DB_PATH",
        "TRAFFIC_BROADCAST_INTERVAL_MS",
        "TRAFFIC_WINDOW_SECS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "api": { "addr": "0.0.0.0:9000" },
        "broadcast_interval_ms": 500,
        "persistence": { "kind": "csv", "path": "records", "window_secs": 30 },
        "cameras": [
            {
                "camera_id": "north",
                "source": "stub://north?frames=10",
                "zones": [
                    { "zone_id": "lane1", "polygon": [[0, 0], [100, 0], [100, 50]] }
                ],
                "performance": { "detect_every_n": 2 }
            },
            {
                "camera_id": "south",
                "source": "stub://south",
                "on_detection_error": "stop"
            }
        ]
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("TRAFFIC_CONFIG", file.path());
    std::env::set_var("TRAFFIC_WINDOW_SECS", "15");
    std::env::set_var("TRAFFIC_DB_PATH", "/tmp/traffic-test");

    let cfg = AppConfig::load().expect("load config");

    assert_eq!(cfg.api_addr, "0.0.0.0:9000");
    assert_eq!(cfg.broadcast_interval, Duration::from_millis(500));
    assert_eq!(cfg.persistence.kind, "csv");
    assert_eq!(cfg.persistence.window_secs, 15.0);
    assert_eq!(cfg.persistence.path, std::path::PathBuf::from("/tmp/traffic-test"));
    assert_eq!(cfg.cameras.len(), 2);
    let north = &cfg.cameras[0];
    assert_eq!(north.performance.detect_every_n, 2);
    assert_eq!(north.zones[0].camera_id.as_deref(), Some("north"));
    assert!(cfg.cameras[1].zones.is_empty());

    clear_env();
}

#[test]
fn defaults_without_a_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = AppConfig::load().expect("defaults");
    assert_eq!(cfg.api_addr, "127.0.0.1:8080");
    assert_eq!(cfg.broadcast_interval, Duration::from_secs(2));
    assert_eq!(cfg.cameras.len(), 1);
    assert_eq!(cfg.cameras[0].camera_id, "front_camera");
    assert_eq!(cfg.cameras[0].zones[0].zone_id, "zone1");
}

#[test]
fn rejects_duplicate_camera_ids() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "cameras": [
            { "camera_id": "a", "source": "stub://a" },
            { "camera_id": "a", "source": "stub://b" }
        ]
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    let err = AppConfig::load_from(Some(file.path())).unwrap_err();
    assert!(matches!(
        classify(&err),
        Some(VisionError::DuplicateCamera(id)) if id == "a"
    ));
}

#[test]
fn rejects_malformed_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("TRAFFIC_BROADCAST_INTERVAL_MS", "soon");
    assert!(AppConfig::load().is_err());
    std::env::set_var("TRAFFIC_BROADCAST_INTERVAL_MS", "0");
    assert!(AppConfig::load().is_err());

    clear_env();
}
