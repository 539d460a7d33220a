//! Checkpoint records and the task-keyed stores that hold them.

use crate::error::MlError;
use crate::optim::MultiStepLr;
use crate::training::metrics::EpochStats;
use chrono::{DateTime, Utc};
use repro_core::persistence::{atomic_write_json, load_json, remove_if_exists};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Everything needed to resume a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: u64,
    pub iteration: u64,
    pub model: serde_json::Value,
    pub optimizer: serde_json::Value,
    #[serde(default)]
    pub scheduler: Option<MultiStepLr>,
    pub history: Vec<EpochStats>,
    pub saved_at: DateTime<Utc>,
}

/// Holds at most one checkpoint for the current task.
pub trait CheckpointStore: Send {
    fn load(&self) -> Result<Option<Checkpoint>, MlError>;

    /// Replace the stored checkpoint.
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), MlError>;

    /// Drop the stored checkpoint, if any.
    fn clear(&mut self) -> Result<(), MlError>;
}

/// JSON checkpoint at `<dir>/<task_id>/checkpoint.json`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(base_dir: &Path, task_id: &str) -> Result<Self, MlError> {
        if task_id.is_empty() || task_id.contains(['/', '\\']) || task_id == ".." {
            return Err(MlError::checkpoint(format!("invalid task id '{task_id}'")));
        }
        Ok(Self {
            dir: base_dir.join(task_id),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<Checkpoint>, MlError> {
        let path = self.path();
        let checkpoint = load_json::<Checkpoint>(&path).map_err(|e| {
            MlError::checkpoint(format!("cannot read {}: {e}", path.display()))
        })?;
        if let Some(c) = &checkpoint {
            debug!(path = %path.display(), epoch = c.epoch, "Loaded checkpoint");
        }
        Ok(checkpoint)
    }

    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), MlError> {
        atomic_write_json(&self.path(), checkpoint)?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), MlError> {
        if remove_if_exists(&self.path())? {
            info!(path = %self.path().display(), "Checkpoint cleared");
        }
        // Only succeeds once the task directory is empty.
        let _ = std::fs::remove_dir(&self.dir);
        Ok(())
    }
}

/// Process-local store; clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    slot: Arc<Mutex<Option<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(checkpoint))),
        }
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<Checkpoint>>, MlError> {
        self.slot
            .lock()
            .map_err(|_| MlError::checkpoint("checkpoint store mutex poisoned"))
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load(&self) -> Result<Option<Checkpoint>, MlError> {
        Ok(self.slot()?.clone())
    }

    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), MlError> {
        *self.slot()? = Some(checkpoint.clone());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), MlError> {
        *self.slot()? = None;
        Ok(())
    }
}
