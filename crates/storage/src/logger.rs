//! Asynchronous Session Logger
//!
//! Producers push events and readings onto an unbounded queue and return
//! immediately. One task drains the queue, merges readings into a per-PID
//! snapshot and rewrites the session file atomically after every item.

use crate::StorageError;
use chrono::{DateTime, Utc};
use metrics::gauge;
use obd_protocol::Reading;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Logger settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Directory receiving one JSON file per session
    pub directory: PathBuf,
    /// Queue depth that triggers a warning
    pub high_water_mark: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            high_water_mark: 1024,
        }
    }
}

/// One logged event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
}

/// Contents of the session file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: Uuid,
    pub started_at: DateTime<Utc>,
    pub vin: Option<String>,
    /// Last value per PID
    pub readings: BTreeMap<String, f64>,
    pub events: Vec<LogEvent>,
}

enum LogMessage {
    Event(LogEvent),
    Readings(Vec<Reading>),
    SetVin(String),
    Shutdown,
}

/// Cloneable producer side of the logger
#[derive(Debug, Clone)]
pub struct LoggerHandle {
    tx: mpsc::UnboundedSender<LogMessage>,
    depth: Arc<AtomicUsize>,
    high_water_mark: usize,
    session: Uuid,
    path: PathBuf,
}

impl std::fmt::Debug for LogMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogMessage::Event(e) => write!(f, "Event({})", e.kind),
            LogMessage::Readings(r) => write!(f, "Readings({})", r.len()),
            LogMessage::SetVin(_) => write!(f, "SetVin"),
            LogMessage::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl LoggerHandle {
    /// Append an event
    pub fn log_event(&self, kind: &str, message: impl Into<String>) -> Result<(), StorageError> {
        self.enqueue(LogMessage::Event(LogEvent {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            message: message.into(),
        }))
    }

    /// Merge readings into the snapshot; the latest value per PID wins
    pub fn log_readings(&self, readings: Vec<Reading>) -> Result<(), StorageError> {
        if readings.is_empty() {
            return Ok(());
        }
        self.enqueue(LogMessage::Readings(readings))
    }

    /// Record the session's VIN
    pub fn set_vin(&self, vin: impl Into<String>) -> Result<(), StorageError> {
        self.enqueue(LogMessage::SetVin(vin.into()))
    }

    /// Items waiting for the writer
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// File the writer maintains
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn enqueue(&self, message: LogMessage) -> Result<(), StorageError> {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tx.send(message).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(StorageError::LoggerClosed);
        }
        gauge!("logger_queue_depth").set(depth as f64);
        if depth == self.high_water_mark {
            warn!("Logger queue reached {} pending items", depth);
        }
        Ok(())
    }
}

/// Owner of the writer task
#[derive(Debug)]
pub struct AsyncLogger {
    handle: LoggerHandle,
    task: JoinHandle<SessionSnapshot>,
}

impl AsyncLogger {
    /// Create the log directory and start the writer task
    pub async fn spawn(config: LoggerConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.directory).await?;

        let session = Uuid::new_v4();
        let started_at = Utc::now();
        let path = config.directory.join(format!(
            "session-{}-{}.json",
            started_at.format("%Y%m%dT%H%M%S"),
            session
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let snapshot = SessionSnapshot {
            session,
            started_at,
            vin: None,
            readings: BTreeMap::new(),
            events: Vec::new(),
        };

        info!("Session {} logging to {}", session, path.display());
        let task = tokio::spawn(run_writer(rx, depth.clone(), path.clone(), snapshot));

        Ok(Self {
            handle: LoggerHandle {
                tx,
                depth,
                high_water_mark: config.high_water_mark.max(1),
                session,
                path,
            },
            task,
        })
    }

    /// Producer handle for other tasks
    pub fn handle(&self) -> LoggerHandle {
        self.handle.clone()
    }

    /// Drain everything queued so far, write the final file and join the
    /// writer
    pub async fn shutdown(self) -> Result<SessionSnapshot, StorageError> {
        // fails only if the writer already stopped
        let _ = self.handle.tx.send(LogMessage::Shutdown);
        let snapshot = self
            .task
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?;
        info!(
            "Session {} closed with {} events",
            snapshot.session,
            snapshot.events.len()
        );
        Ok(snapshot)
    }
}

async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<LogMessage>,
    depth: Arc<AtomicUsize>,
    path: PathBuf,
    mut snapshot: SessionSnapshot,
) -> SessionSnapshot {
    while let Some(message) = rx.recv().await {
        if matches!(message, LogMessage::Shutdown) {
            debug!("Logger received shutdown");
            // refuse new items, then take whatever was already queued
            rx.close();
            while let Ok(message) = rx.try_recv() {
                apply(&mut snapshot, &depth, message);
            }
            if let Err(e) = write_atomic(&path, &snapshot).await {
                error!("Failed to write session file {}: {}", path.display(), e);
            }
            break;
        }

        apply(&mut snapshot, &depth, message);
        if let Err(e) = write_atomic(&path, &snapshot).await {
            error!("Failed to write session file {}: {}", path.display(), e);
        }
    }
    snapshot
}

fn apply(snapshot: &mut SessionSnapshot, depth: &AtomicUsize, message: LogMessage) {
    if matches!(message, LogMessage::Shutdown) {
        return;
    }
    let remaining = depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
    gauge!("logger_queue_depth").set(remaining as f64);

    match message {
        LogMessage::Event(event) => snapshot.events.push(event),
        LogMessage::Readings(readings) => {
            for reading in readings {
                snapshot.readings.insert(reading.pid.to_string(), reading.value);
            }
        }
        LogMessage::SetVin(vin) => snapshot.vin = Some(vin),
        LogMessage::Shutdown => {}
    }
}

/// Write to a sibling temp file, then rename over the target
async fn write_atomic(path: &Path, snapshot: &SessionSnapshot) -> Result<(), StorageError> {
    let body = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::{PidCode, PidRegistry};

    fn reading(pid: u8, bytes: &[u8]) -> Reading {
        let registry = PidRegistry::standard();
        let definition = registry.get(&PidCode::current(pid)).unwrap();
        let measured = definition.formula.evaluate(bytes).unwrap();
        Reading::new(definition, bytes.to_vec(), measured)
    }

    fn config(dir: &tempfile::TempDir) -> LoggerConfig {
        LoggerConfig {
            directory: dir.path().join("sessions"),
            ..LoggerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_snapshot_merges_readings_and_keeps_event_order() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AsyncLogger::spawn(config(&dir)).await.unwrap();
        let handle = logger.handle();

        handle.log_event("state", "connecting").unwrap();
        handle.set_vin("1HGCM82633A004352").unwrap();
        handle.log_readings(vec![reading(0x0D, &[0x32])]).unwrap();
        handle.log_event("state", "ready").unwrap();
        handle
            .log_readings(vec![reading(0x0D, &[0x40]), reading(0x0C, &[0x0F, 0xA0])])
            .unwrap();

        let path = handle.path().to_path_buf();
        let snapshot = logger.shutdown().await.unwrap();

        assert_eq!(snapshot.readings.get("010D"), Some(&64.0));
        assert_eq!(snapshot.readings.get("010C"), Some(&1000.0));
        let messages: Vec<_> = snapshot.events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["connecting", "ready"]);

        let on_disk: SessionSnapshot =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, snapshot);
        assert_eq!(on_disk.vin.as_deref(), Some("1HGCM82633A004352"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_producers_after_shutdown_get_closed() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AsyncLogger::spawn(config(&dir)).await.unwrap();
        let handle = logger.handle();
        logger.shutdown().await.unwrap();

        assert!(matches!(
            handle.log_event("state", "late"),
            Err(StorageError::LoggerClosed)
        ));
        assert_eq!(handle.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_queue_drains_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AsyncLogger::spawn(config(&dir)).await.unwrap();
        let handle = logger.handle();

        for i in 0..50 {
            handle.log_event("tick", format!("{}", i)).unwrap();
        }
        let snapshot = logger.shutdown().await.unwrap();

        assert_eq!(snapshot.events.len(), 50);
        assert_eq!(snapshot.events[49].message, "49");
        assert_eq!(handle.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_items_queued_behind_shutdown_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AsyncLogger::spawn(config(&dir)).await.unwrap();
        let producer = logger.handle();

        // the writer has not run yet, so the reading lands behind the sentinel
        logger.handle.tx.send(LogMessage::Shutdown).unwrap();
        producer.log_readings(vec![reading(0x0D, &[0x32])]).unwrap();
        producer.log_event("state", "closing").unwrap();
        assert_eq!(producer.queue_depth(), 2);

        let snapshot = logger.shutdown().await.unwrap();
        assert_eq!(snapshot.readings.get("010D"), Some(&50.0));
        assert_eq!(snapshot.events.len(), 1);
        assert_eq!(producer.queue_depth(), 0);
        assert!(matches!(
            producer.log_event("state", "late"),
            Err(StorageError::LoggerClosed)
        ));
    }
}
