//! Persisted relay state.
//!
//! Four durable key-value stores back the engine: per-source checkpoints,
//! the backfill completion ledger, the deletion mapping, and the live
//! configuration. Every write goes through [`atomic_write`]: serialize to a
//! sibling `.tmp` file, then rename over the target, so a crash mid-write
//! never leaves a torn file behind.
//!
//! Store files live under `<state_dir>/<worker_id>/` and are owned
//! exclusively by their worker; the config store lives at the state root
//! and is owned by the supervisor.

pub mod backfill;
pub mod checkpoint;
pub mod config;
pub mod deletion;

use std::path::{Path, PathBuf};

use serde::Serialize;

use courier_types::RelayError;

pub use backfill::BackfillLedger;
pub use checkpoint::CheckpointStore;
pub use config::ConfigStore;
pub use deletion::{DeletionEntry, DeletionMap};

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub(crate) fn atomic_write<T: Serialize>(path: &Path, value: &T) -> Result<(), RelayError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| RelayError::Store(format!("failed to create state dir: {e}")))?;
    }

    let json = serde_json::to_string_pretty(value)
        .map_err(|e| RelayError::Store(format!("failed to serialize state: {e}")))?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &json)
        .map_err(|e| RelayError::Store(format!("failed to write state tmp: {e}")))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| RelayError::Store(format!("failed to rename state file: {e}")))?;
    Ok(())
}

/// All persisted state owned by one worker.
pub struct WorkerStores {
    pub checkpoints: CheckpointStore,
    pub backfill: BackfillLedger,
    pub deletions: DeletionMap,
}

impl WorkerStores {
    /// Open (or create) the stores under `<state_dir>/<worker_id>/`.
    pub fn open(state_dir: &Path, worker_id: &str) -> Self {
        let dir = worker_dir(state_dir, worker_id);
        Self {
            checkpoints: CheckpointStore::load(dir.join("checkpoints.json")),
            backfill: BackfillLedger::load(dir.join("backfill.json")),
            deletions: DeletionMap::load(dir.join("deletions.json")),
        }
    }

    /// Flush all three stores. Called before shutdown and after batches.
    pub fn flush(&self) -> Result<(), RelayError> {
        self.checkpoints.save()?;
        self.backfill.save()?;
        self.deletions.save()
    }
}

/// Directory holding one worker's state files.
pub fn worker_dir(state_dir: &Path, worker_id: &str) -> PathBuf {
    state_dir.join(worker_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_leaves_no_tmp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("state.json");

        atomic_write(&path, &vec![1, 2, 3]).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let back: Vec<i32> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[test]
    fn worker_stores_open_and_flush() {
        let tmp = tempfile::tempdir().unwrap();
        let mut stores = WorkerStores::open(tmp.path(), "w1");

        stores.checkpoints.advance(-1001, 42);
        stores.backfill.mark_complete(-1001, -2001, 123);
        stores.flush().unwrap();

        let reopened = WorkerStores::open(tmp.path(), "w1");
        assert_eq!(reopened.checkpoints.get(-1001), Some(42));
        assert!(reopened.backfill.is_complete(-1001, -2001));
    }
}
