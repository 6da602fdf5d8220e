//! Per-source checkpoint store.
//!
//! Maps each source feed id to the last message id that was either
//! delivered or deliberately skipped. Advancement is strictly monotonic and
//! happens only after the delivery (or skip decision) succeeded, which is
//! what makes restarts at-least-once instead of lossy.

use std::collections::HashMap;
use std::path::PathBuf;

use courier_types::RelayError;

use super::atomic_write;

pub struct CheckpointStore {
    path: PathBuf,
    entries: HashMap<i64, i64>,
}

impl CheckpointStore {
    /// Load from disk; a missing or unparseable file yields an empty store
    /// (the engine re-initializes sources at the live tail).
    pub fn load(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e,
                        "failed to parse checkpoint file, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self { path, entries }
    }

    /// Last processed message id for a source, if any was ever recorded.
    pub fn get(&self, source: i64) -> Option<i64> {
        self.entries.get(&source).copied()
    }

    /// Whether a source has a checkpoint at all.
    pub fn contains(&self, source: i64) -> bool {
        self.entries.contains_key(&source)
    }

    /// Advance the checkpoint for `source` to `message_id`.
    ///
    /// Returns `false` (and changes nothing) if `message_id` would move the
    /// checkpoint backwards.
    pub fn advance(&mut self, source: i64, message_id: i64) -> bool {
        match self.entries.get(&source) {
            Some(&current) if message_id <= current => false,
            _ => {
                self.entries.insert(source, message_id);
                true
            }
        }
    }

    /// Drop the checkpoint for a source (pair removed by the operator).
    pub fn remove(&mut self, source: i64) {
        self.entries.remove(&source);
    }

    pub fn save(&self) -> Result<(), RelayError> {
        atomic_write(&self.path, &self.entries)
    }
}
