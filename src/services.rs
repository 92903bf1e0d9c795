//! Collaborator interfaces consumed by the access manager
//!
//! Audio playback, snapshot persistence and user-facing notifications are
//! owned by other parts of the application. This module defines the traits
//! they are reached through plus the small implementations used by the
//! binary and the tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Instrument playback, injected into handler instances
pub trait InstrumentPlaybackService: Send + Sync {
    /// Play a note; must return without waiting for the note to end
    fn play_note(&self, note: u8, duration_ms: u64, velocity: u8);

    fn load_instrument(&self, key: &str);
}

/// Playback service that only logs, for running without an audio engine
pub struct LoggingPlayback;

impl InstrumentPlaybackService for LoggingPlayback {
    fn play_note(&self, note: u8, duration_ms: u64, velocity: u8) {
        info!("🎹 play note {} vel {} for {}ms", note, velocity, duration_ms);
    }

    fn load_instrument(&self, key: &str) {
        info!("🎹 load instrument '{}'", key);
    }
}

/// A device recorded in the connectivity snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDevice {
    pub id: String,
    pub name: String,
    pub manufacturer: String,
}

/// Devices connected at the time of the last change, used as a hint that
/// hardware is expected to come back after a disconnect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivitySnapshot {
    /// Milliseconds since epoch
    pub timestamp: u64,
    pub version: String,
    pub devices: Vec<KnownDevice>,
}

impl ConnectivitySnapshot {
    /// Current snapshot format version
    pub const VERSION: &'static str = "1.0.0";

    pub fn new(devices: Vec<KnownDevice>) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
            version: Self::VERSION.to_string(),
            devices,
        }
    }
}

#[async_trait]
pub trait PersistenceService: Send + Sync {
    async fn load_snapshot(&self) -> Result<Option<ConnectivitySnapshot>>;

    async fn save_snapshot(&self, snapshot: &ConnectivitySnapshot) -> Result<()>;
}

/// In-memory persistence, for sessions without a snapshot file
#[derive(Default)]
pub struct MemoryPersistence {
    snapshot: Mutex<Option<ConnectivitySnapshot>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: ConnectivitySnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
        }
    }

    pub fn current(&self) -> Option<ConnectivitySnapshot> {
        self.snapshot.lock().clone()
    }
}

#[async_trait]
impl PersistenceService for MemoryPersistence {
    async fn load_snapshot(&self) -> Result<Option<ConnectivitySnapshot>> {
        Ok(self.snapshot.lock().clone())
    }

    async fn save_snapshot(&self, snapshot: &ConnectivitySnapshot) -> Result<()> {
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }
}

/// Snapshot stored as pretty JSON on disk
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PersistenceService for JsonFilePersistence {
    async fn load_snapshot(&self) -> Result<Option<ConnectivitySnapshot>> {
        let json = match fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: ConnectivitySnapshot = serde_json::from_str(&json).map_err(|e| {
            Error::Persistence(format!(
                "failed to parse snapshot {}: {}",
                self.path.display(),
                e
            ))
        })?;

        debug!(
            "Connectivity snapshot loaded (version: {}, {} devices)",
            snapshot.version,
            snapshot.devices.len()
        );
        Ok(Some(snapshot))
    }

    async fn save_snapshot(&self, snapshot: &ConnectivitySnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// Human-readable status text for presentation layers
pub trait NotificationSink: Send + Sync {
    fn notify(&self, level: NotificationLevel, text: &str);
}

/// Routes notifications into the log
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify(&self, level: NotificationLevel, text: &str) {
        match level {
            NotificationLevel::Info => info!("{}", text),
            NotificationLevel::Warning => warn!("{}", text),
            NotificationLevel::Error => error!("{}", text),
        }
    }
}

pub struct NoopNotifier;

impl NotificationSink for NoopNotifier {
    fn notify(&self, _level: NotificationLevel, _text: &str) {}
}

/// Forwards each error kind to the sink at most once per session
pub struct ErrorReporter {
    sink: Arc<dyn NotificationSink>,
    reported: Mutex<HashSet<String>>,
}

impl ErrorReporter {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Returns true if the message was delivered (first time for `kind`)
    pub fn report_once(&self, kind: &str, level: NotificationLevel, text: &str) -> bool {
        if !self.reported.lock().insert(kind.to_string()) {
            debug!("Suppressing repeated '{}' notification", kind);
            return false;
        }
        self.sink.notify(level, text);
        true
    }

    pub fn info(&self, text: &str) {
        self.sink.notify(NotificationLevel::Info, text);
    }

    /// Forget what was reported, e.g. when the environment changed
    pub fn reset(&self) {
        self.reported.lock().clear();
    }
}
