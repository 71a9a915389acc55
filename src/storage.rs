//! Traffic record persistence.
//!
//! `TrafficRepository` is the append-only sink the aggregator writes to. The
//! SQLite and CSV backends write synchronously; `PersistenceWorker` moves that
//! I/O onto its own thread so a processing worker never waits on disk.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDate};
use crossbeam_channel::{bounded, Sender, TrySendError};
use rusqlite::{params, Connection};

use crate::error::VisionError;
use crate::join_bounded;
use crate::model::TrafficData;

pub trait TrafficRepository: Send {
    fn save(&mut self, record: &TrafficData) -> Result<()>;

    fn save_batch(&mut self, records: &[TrafficData]) -> Result<()> {
        for record in records {
            self.save(record)?;
        }
        Ok(())
    }

    fn describe(&self) -> String;
}

fn persistence_err(err: impl std::fmt::Display) -> anyhow::Error {
    VisionError::Persistence(err.to_string()).into()
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqliteTrafficRepository {
    conn: Connection,
    path: String,
}

impl SqliteTrafficRepository {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(persistence_err)?;
        let mut repo = Self {
            conn,
            path: db_path.to_string(),
        };
        repo.ensure_schema()?;
        Ok(repo)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(persistence_err)?;
        let mut repo = Self {
            conn,
            path: ":memory:".to_string(),
        };
        repo.ensure_schema()?;
        Ok(repo)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS traffic_data (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp REAL NOT NULL,
              zone_id TEXT NOT NULL,
              camera_id TEXT NOT NULL,
              street_monitored TEXT NOT NULL,
              duration_seconds REAL NOT NULL,
              avg_density REAL NOT NULL,
              total_vehicles INTEGER NOT NULL,
              avg_speed REAL NOT NULL,
              avg_occupancy REAL NOT NULL,
              flow_rate_per_min INTEGER NOT NULL,
              car_count INTEGER NOT NULL,
              bus_count INTEGER NOT NULL,
              truck_count INTEGER NOT NULL,
              motorcycle_count INTEGER NOT NULL,
              vehicle_types_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_traffic_camera_ts ON traffic_data(camera_id, timestamp);
            "#,
        )?;
        Ok(())
    }

    /// Most recent `limit` records, oldest first.
    pub fn read_recent(&self, limit: usize) -> Result<Vec<TrafficData>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, zone_id, camera_id, street_monitored, duration_seconds,
                   avg_density, total_vehicles, avg_speed, avg_occupancy, flow_rate_per_min,
                   car_count, bus_count, truck_count, motorcycle_count, vehicle_types_json
            FROM traffic_data ORDER BY id DESC LIMIT ?1
            "#,
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let types_json: String = row.get(14)?;
            out.push(TrafficData {
                timestamp: row.get(0)?,
                zone_id: row.get(1)?,
                camera_id: row.get(2)?,
                street_monitored: row.get(3)?,
                duration_seconds: row.get(4)?,
                avg_density: row.get(5)?,
                total_vehicles: row.get::<_, i64>(6)? as usize,
                avg_speed: row.get(7)?,
                avg_occupancy: row.get(8)?,
                flow_rate_per_min: row.get::<_, i64>(9)? as usize,
                car_count: row.get::<_, i64>(10)? as usize,
                bus_count: row.get::<_, i64>(11)? as usize,
                truck_count: row.get::<_, i64>(12)? as usize,
                motorcycle_count: row.get::<_, i64>(13)? as usize,
                vehicle_types: serde_json::from_str(&types_json)?,
            });
        }
        out.reverse();
        Ok(out)
    }

    fn insert(conn: &Connection, record: &TrafficData) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO traffic_data(
              timestamp, zone_id, camera_id, street_monitored, duration_seconds,
              avg_density, total_vehicles, avg_speed, avg_occupancy, flow_rate_per_min,
              car_count, bus_count, truck_count, motorcycle_count, vehicle_types_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                record.timestamp,
                record.zone_id,
                record.camera_id,
                record.street_monitored,
                record.duration_seconds,
                record.avg_density,
                record.total_vehicles as i64,
                record.avg_speed,
                record.avg_occupancy,
                record.flow_rate_per_min as i64,
                record.car_count as i64,
                record.bus_count as i64,
                record.truck_count as i64,
                record.motorcycle_count as i64,
                serde_json::to_string(&record.vehicle_types)?,
            ],
        )?;
        Ok(())
    }
}

impl TrafficRepository for SqliteTrafficRepository {
    fn save(&mut self, record: &TrafficData) -> Result<()> {
        Self::insert(&self.conn, record).map_err(persistence_err)
    }

    fn save_batch(&mut self, records: &[TrafficData]) -> Result<()> {
        let tx = self.conn.transaction().map_err(persistence_err)?;
        for record in records {
            Self::insert(&tx, record).map_err(persistence_err)?;
        }
        tx.commit().map_err(persistence_err)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path)
    }
}

// ----------------------------------------------------------------------------
// CSV, rotated daily
// ----------------------------------------------------------------------------

pub const CSV_HEADER: &str = "timestamp,camera_id,street_monitored,car_count,bus_count,\
truck_count,motorcycle_count,total_vehicles,occupancy_rate,flow_rate_per_min,avg_speed,\
avg_density,zone_id,duration_seconds";

pub struct CsvTrafficRepository {
    dir: PathBuf,
    current: Option<(NaiveDate, File)>,
}

impl CsvTrafficRepository {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            VisionError::Persistence(format!("create {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir, current: None })
    }

    pub fn file_for(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("traffic_log_{}.csv", day.format("%Y-%m-%d")))
    }

    fn writer_for(&mut self, day: NaiveDate) -> Result<&mut File> {
        let rotate = !matches!(&self.current, Some((open_day, _)) if *open_day == day);
        if rotate {
            let path = self.file_for(day);
            let fresh = !path.exists();
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            if fresh {
                writeln!(file, "{}", CSV_HEADER)?;
            }
            log::info!("csv repository writing to {}", path.display());
            self.current = Some((day, file));
        }
        match self.current.as_mut() {
            Some((_, file)) => Ok(file),
            None => Err(anyhow!("csv writer unavailable")),
        }
    }

    /// Write one row into the file for `day`.
    pub fn save_on(&mut self, day: NaiveDate, record: &TrafficData) -> Result<()> {
        let row = csv_row(record);
        let file = self.writer_for(day).map_err(persistence_err)?;
        writeln!(file, "{}", row).map_err(persistence_err)?;
        Ok(())
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_row(r: &TrafficData) -> String {
    format!(
        "{:.2},{},{},{},{},{},{},{},{:.4},{},{:.2},{:.2},{},{:.2}",
        r.timestamp,
        csv_field(&r.camera_id),
        csv_field(&r.street_monitored),
        r.car_count,
        r.bus_count,
        r.truck_count,
        r.motorcycle_count,
        r.total_vehicles,
        r.avg_occupancy,
        r.flow_rate_per_min,
        r.avg_speed,
        r.avg_density,
        csv_field(&r.zone_id),
        r.duration_seconds
    )
}

impl TrafficRepository for CsvTrafficRepository {
    fn save(&mut self, record: &TrafficData) -> Result<()> {
        self.save_on(Local::now().date_naive(), record)
    }

    fn describe(&self) -> String {
        format!("csv:{}", self.dir.display())
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

/// Shared in-memory sink. Clones see the same records.
#[derive(Clone, Default)]
pub struct InMemoryTrafficRepository {
    records: Arc<Mutex<Vec<TrafficData>>>,
}

impl InMemoryTrafficRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TrafficData> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TrafficRepository for InMemoryTrafficRepository {
    fn save(&mut self, record: &TrafficData) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| persistence_err("in-memory repository lock poisoned"))?
            .push(record.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// ----------------------------------------------------------------------------
// Background worker
// ----------------------------------------------------------------------------

/// Repository adapter that hands batches to a dedicated I/O thread.
///
/// The queue is bounded; a full queue drops the batch with a warning instead
/// of blocking the caller. Dropping the worker closes the queue, lets the
/// thread drain what was already accepted, and waits at most `join_timeout`.
pub struct PersistenceWorker {
    tx: Option<Sender<Vec<TrafficData>>>,
    handle: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
    join_timeout: Duration,
    name: String,
}

impl PersistenceWorker {
    pub const DEFAULT_CAPACITY: usize = 100;

    pub fn spawn(mut repository: Box<dyn TrafficRepository>, capacity: usize) -> Result<Self> {
        let (tx, rx) = bounded::<Vec<TrafficData>>(capacity.max(1));
        let name = repository.describe();
        let handle = std::thread::Builder::new()
            .name("traffic-persist".to_string())
            .spawn(move || {
                for batch in rx.iter() {
                    if let Err(err) = repository.save_batch(&batch) {
                        log::warn!(
                            "persistence: failed to save {} records to {}: {:#}",
                            batch.len(),
                            repository.describe(),
                            err
                        );
                    }
                }
                log::debug!("persistence worker for {} exiting", repository.describe());
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            dropped: Arc::new(AtomicU64::new(0)),
            join_timeout: Duration::from_secs(3),
            name,
        })
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Batches discarded because the queue was full.
    pub fn dropped_batches(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait (bounded) for pending batches to be written.
    pub fn stop(&mut self) {
        self.tx.take();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if join_bounded(handle, self.join_timeout).is_err() {
            log::warn!(
                "persistence worker for {} did not finish within {:?}; abandoning",
                self.name,
                self.join_timeout
            );
        }
    }
}

impl TrafficRepository for PersistenceWorker {
    fn save(&mut self, record: &TrafficData) -> Result<()> {
        self.save_batch(std::slice::from_ref(record))
    }

    fn save_batch(&mut self, records: &[TrafficData]) -> Result<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(persistence_err("persistence worker stopped"));
        };
        match tx.try_send(records.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(batch)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "persistence queue full; dropped {} records ({} batches dropped so far)",
                    batch.len(),
                    dropped
                );
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(persistence_err("persistence worker exited"))
            }
        }
    }

    fn describe(&self) -> String {
        format!("async({})", self.name)
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open the repository named by `kind`.
pub fn open_repository(kind: &str, path: &Path) -> Result<Box<dyn TrafficRepository>> {
    match kind {
        "sqlite" => {
            let path = path
                .to_str()
                .ok_or_else(|| VisionError::config("sqlite path is not valid UTF-8"))?;
            Ok(Box::new(SqliteTrafficRepository::open(path)?))
        }
        "csv" => Ok(Box::new(CsvTrafficRepository::open(path)?)),
        "memory" => Ok(Box::new(InMemoryTrafficRepository::new())),
        other => Err(VisionError::config(format!(
            "unknown persistence kind '{}' (expected sqlite, csv or memory)",
            other
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VehicleType;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn record(zone: &str, total: usize) -> TrafficData {
        TrafficData {
            timestamp: 1_700_000_000.0,
            zone_id: zone.to_string(),
            camera_id: "cam1".to_string(),
            street_monitored: "Main St, North".to_string(),
            duration_seconds: 60.0,
            avg_density: 1.5,
            total_vehicles: total,
            avg_speed: 13.333,
            avg_occupancy: 0.12345,
            flow_rate_per_min: total,
            car_count: total,
            bus_count: 0,
            truck_count: 0,
            motorcycle_count: 0,
            vehicle_types: BTreeMap::from([(VehicleType::Car, total)]),
        }
    }

    #[test]
    fn sqlite_round_trips_batches() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("traffic.db");
        let mut repo = SqliteTrafficRepository::open(path.to_str().unwrap())?;
        repo.save_batch(&[record("zone1", 3), record("zone2", 1)])?;
        repo.save(&record("zone1", 4))?;

        let rows = repo.read_recent(10)?;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], record("zone1", 3));
        assert_eq!(rows[2].total_vehicles, 4);
        assert_eq!(repo.read_recent(1)?[0].total_vehicles, 4);
        Ok(())
    }

    #[test]
    fn csv_writes_header_once_per_day_and_quotes_fields() -> Result<()> {
        let dir = tempdir()?;
        let mut repo = CsvTrafficRepository::open(dir.path())?;
        let day1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        repo.save_on(day1, &record("zone1", 3))?;
        repo.save_on(day1, &record("zone2", 1))?;
        repo.save_on(day2, &record("zone1", 2))?;

        let first = std::fs::read_to_string(repo.file_for(day1))?;
        let lines: Vec<&str> = first.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(
            lines[1],
            "1700000000.00,cam1,\"Main St, North\",3,0,0,0,3,0.1235,3,13.33,1.50,zone1,60.00"
        );
        let second = std::fs::read_to_string(repo.file_for(day2))?;
        assert_eq!(second.lines().count(), 2);
        Ok(())
    }

    #[test]
    fn worker_drains_on_stop() -> Result<()> {
        let sink = InMemoryTrafficRepository::new();
        let mut worker = PersistenceWorker::spawn(Box::new(sink.clone()), 8)?;
        worker.save_batch(&[record("zone1", 1), record("zone2", 2)])?;
        worker.save(&record("zone3", 3))?;
        worker.stop();
        assert_eq!(sink.records().len(), 3);
        assert!(worker.save(&record("zone4", 4)).is_err());
        Ok(())
    }

    #[test]
    fn unknown_kind_is_a_config_error() {
        let err = match open_repository("parquet", Path::new("/tmp/x")) {
            Ok(_) => panic!("parquet is not supported"),
            Err(err) => err,
        };
        assert!(matches!(
            crate::error::classify(&err),
            Some(VisionError::Configuration(_))
        ));
    }
}
