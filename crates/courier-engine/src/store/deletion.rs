//! Deletion mapping store.
//!
//! Records, for every delivered message, which target message it produced,
//! keyed `"<source>:<source_msg_id>"`. The deletion synchronizer consumes
//! this to propagate source deletions. Retention is bounded: once the map
//! exceeds [`MAX_ENTRIES`], the oldest [`PRUNE_BATCH`] entries by timestamp
//! are dropped, so the file never grows without limit.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use courier_types::RelayError;

use super::atomic_write;

/// Entries beyond this trigger a prune on insert.
pub const MAX_ENTRIES: usize = 5000;
/// How many of the oldest entries a prune removes.
pub const PRUNE_BATCH: usize = 1000;

/// Where one delivered message ended up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionEntry {
    pub target_id: i64,
    pub target_msg_id: i64,
    /// Unix timestamp (fractional seconds) of delivery; prune order.
    pub timestamp: f64,
}

pub struct DeletionMap {
    path: PathBuf,
    entries: HashMap<String, DeletionEntry>,
}

fn map_key(source: i64, source_msg_id: i64) -> String {
    format!("{source}:{source_msg_id}")
}

impl DeletionMap {
    pub fn load(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e,
                        "failed to parse deletion map, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self { path, entries }
    }

    /// Record a delivery, pruning the oldest entries when over capacity.
    pub fn record(&mut self, source: i64, source_msg_id: i64, entry: DeletionEntry) {
        self.entries.insert(map_key(source, source_msg_id), entry);
        if self.entries.len() > MAX_ENTRIES {
            self.prune();
        }
    }

    pub fn lookup(&self, source: i64, source_msg_id: i64) -> Option<&DeletionEntry> {
        self.entries.get(&map_key(source, source_msg_id))
    }

    /// Evict an entry once its deletion has been synced (or found gone).
    pub fn remove(&mut self, source: i64, source_msg_id: i64) -> Option<DeletionEntry> {
        self.entries.remove(&map_key(source, source_msg_id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune(&mut self) {
        let mut keys: Vec<(String, f64)> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.timestamp))
            .collect();
        keys.sort_by(|a, b| a.1.total_cmp(&b.1));

        let removed = keys.len().min(PRUNE_BATCH);
        for (key, _) in keys.into_iter().take(PRUNE_BATCH) {
            self.entries.remove(&key);
        }
        tracing::info!(removed, remaining = self.entries.len(), "pruned deletion map");
    }

    pub fn save(&self) -> Result<(), RelayError> {
        atomic_write(&self.path, &self.entries)
    }
}
