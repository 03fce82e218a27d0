//! On-disk engine snapshot for restart recovery

use crate::error::PersistenceError;
use crate::models::Instance;
use crate::supervisor::Lifecycle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Inventory plus in-flight lifecycles, enough to rebuild supervisor state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub taken_at: DateTime<Utc>,
    pub instances: Vec<Instance>,
    pub lifecycles: Vec<Lifecycle>,
}

impl EngineSnapshot {
    pub fn new(instances: Vec<Instance>, lifecycles: Vec<Lifecycle>) -> Self {
        Self {
            taken_at: Utc::now(),
            instances,
            lifecycles,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot atomically (temp file, fsync, rename)
    pub fn save(&self, snapshot: &EngineSnapshot) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
            }
        }

        let json = serde_json::to_vec_pretty(snapshot)?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| PersistenceError::io(&temp_path, e))?;
        file.write_all(&json)
            .map_err(|e| PersistenceError::io(&temp_path, e))?;
        file.sync_all()
            .map_err(|e| PersistenceError::io(&temp_path, e))?;

        std::fs::rename(&temp_path, &self.path).map_err(|e| PersistenceError::io(&self.path, e))?;

        debug!(
            path = %self.path.display(),
            instances = snapshot.instances.len(),
            lifecycles = snapshot.lifecycles.len(),
            "Snapshot persisted"
        );
        Ok(())
    }

    /// Load the last snapshot; `None` on first start
    pub fn load(&self) -> Result<Option<EngineSnapshot>, PersistenceError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistenceError::io(&self.path, e)),
        };
        let snapshot: EngineSnapshot = serde_json::from_slice(&data)?;
        info!(
            path = %self.path.display(),
            taken_at = %snapshot.taken_at,
            instances = snapshot.instances.len(),
            lifecycles = snapshot.lifecycles.len(),
            "Loaded snapshot from disk"
        );
        Ok(Some(snapshot))
    }
}
