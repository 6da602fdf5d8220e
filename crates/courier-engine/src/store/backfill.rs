//! Backfill completion ledger.
//!
//! One entry per channel pair, keyed `"<source>:<target>"`, holding the
//! unix timestamp of backfill completion. Written exactly once per pair;
//! absence means the pair still needs backfill, and an operator deleting an
//! entry deliberately re-triggers a full run.

use std::collections::HashMap;
use std::path::PathBuf;

use courier_types::RelayError;

use super::atomic_write;

pub struct BackfillLedger {
    path: PathBuf,
    entries: HashMap<String, i64>,
}

fn pair_key(source: i64, target: i64) -> String {
    format!("{source}:{target}")
}

impl BackfillLedger {
    pub fn load(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e,
                        "failed to parse backfill ledger, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self { path, entries }
    }

    pub fn is_complete(&self, source: i64, target: i64) -> bool {
        self.entries.contains_key(&pair_key(source, target))
    }

    /// Record completion at `timestamp` (unix seconds).
    pub fn mark_complete(&mut self, source: i64, target: i64, timestamp: i64) {
        self.entries.insert(pair_key(source, target), timestamp);
    }

    /// Operator path: clearing the marker re-triggers backfill for the pair.
    pub fn clear(&mut self, source: i64, target: i64) {
        self.entries.remove(&pair_key(source, target));
    }

    pub fn save(&self) -> Result<(), RelayError> {
        atomic_write(&self.path, &self.entries)
    }
}
