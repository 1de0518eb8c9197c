//! Persistence service: periodic canvas snapshots behind a pluggable store.
//!
//! DESIGN
//! ======
//! The hub owns the live stroke log; persistence only ever sees copies. A
//! background task asks the hub for a snapshot on a fixed interval and also
//! drains an immediate-save queue that the hub feeds after a canvas clear.
//! Disk I/O therefore never runs on the hub task.
//!
//! ERROR HANDLING
//! ==============
//! Save failures are logged and retried on the next tick. A snapshot file
//! that is missing or fails to parse means the server starts with an empty
//! canvas; it never refuses to boot over it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::StorageBackend;
use crate::services::hub::HubHandle;
use crate::state::Stroke;

/// Capacity of the immediate-save queue between hub and snapshot task.
pub const SNAPSHOT_QUEUE_CAPACITY: usize = 4;

/// On-disk layout of a saved canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasSnapshot {
    pub strokes: Vec<Stroke>,
    #[serde(default)]
    pub total_strokes: usize,
    #[serde(default)]
    pub capacity: usize,
    /// Milliseconds since Unix epoch.
    #[serde(default)]
    pub last_update: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("snapshot io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// STORES
// =============================================================================

/// Where snapshots are kept.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the last saved snapshot. `Ok(None)` when nothing was ever saved.
    async fn load(&self) -> Result<Option<CanvasSnapshot>, PersistenceError>;

    /// Replace the saved snapshot.
    async fn save(&self, snapshot: &CanvasSnapshot) -> Result<(), PersistenceError>;

    /// Short human-readable location for logs.
    fn describe(&self) -> String;
}

/// Pretty-printed JSON file. Writes land in a sibling temp file that is
/// renamed over the target, so a crash mid-write leaves the old file intact.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map_or_else(|| "canvas".into(), |n| n.to_string_lossy().into_owned());
        self.path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> Result<Option<CanvasSnapshot>, PersistenceError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn save(&self, snapshot: &CanvasSnapshot) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.temp_path();
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    slot: Mutex<Option<CanvasSnapshot>>,
}

impl MemorySnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<CanvasSnapshot>, PersistenceError> {
        Ok(self.slot.lock().map_or(None, |slot| slot.clone()))
    }

    async fn save(&self, snapshot: &CanvasSnapshot) -> Result<(), PersistenceError> {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(snapshot.clone());
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

/// Build the store selected by configuration.
#[must_use]
pub fn open_store(backend: &StorageBackend) -> Arc<dyn SnapshotStore> {
    match backend {
        StorageBackend::File(path) => Arc::new(FileSnapshotStore::new(path.clone())),
        StorageBackend::Memory => Arc::new(MemorySnapshotStore::new()),
    }
}

/// Load the saved canvas, treating a missing or unreadable snapshot as empty.
pub async fn load_or_empty(store: &dyn SnapshotStore) -> Option<CanvasSnapshot> {
    match store.load().await {
        Ok(Some(snapshot)) => {
            info!(store = %store.describe(), strokes = snapshot.strokes.len(), "canvas snapshot loaded");
            Some(snapshot)
        }
        Ok(None) => {
            info!(store = %store.describe(), "no canvas snapshot; starting empty");
            None
        }
        Err(e) => {
            warn!(store = %store.describe(), error = %e, "canvas snapshot unreadable; starting empty");
            None
        }
    }
}

/// Save and log the outcome. Returns whether the write succeeded.
pub async fn save_logged(store: &dyn SnapshotStore, snapshot: &CanvasSnapshot) -> bool {
    match store.save(snapshot).await {
        Ok(()) => {
            debug!(store = %store.describe(), strokes = snapshot.strokes.len(), "canvas snapshot saved");
            true
        }
        Err(e) => {
            error!(store = %store.describe(), error = %e, "canvas snapshot save failed");
            false
        }
    }
}

// =============================================================================
// BACKGROUND TASK
// =============================================================================

/// Spawn the snapshot task. It exits once the hub is gone.
pub fn spawn_snapshot_task(
    hub: HubHandle,
    store: Arc<dyn SnapshotStore>,
    interval: Duration,
    mut immediate_rx: mpsc::Receiver<CanvasSnapshot>,
) -> JoinHandle<()> {
    info!(store = %store.describe(), interval_secs = interval.as_secs(), "canvas snapshots configured");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick fires immediately; nothing has changed yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(snapshot) = hub.snapshot().await else {
                        break;
                    };
                    save_logged(store.as_ref(), &snapshot).await;
                }
                maybe_snapshot = immediate_rx.recv() => {
                    let Some(snapshot) = maybe_snapshot else {
                        break;
                    };
                    save_logged(store.as_ref(), &snapshot).await;
                }
            }
        }
        debug!("snapshot task stopped");
    })
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
