//! Live configuration store.
//!
//! Owns the on-disk `config.json`, validates every mutation before it is
//! persisted, and exposes a watch channel carrying the config version
//! counter. Subscribers (the supervisor) treat a version bump as the reload
//! signal; there are no sentinel files to race on.

use std::path::PathBuf;
use std::time::SystemTime;

use tokio::sync::watch;

use courier_types::{RelayConfig, RelayError};

use super::atomic_write;

pub struct ConfigStore {
    path: PathBuf,
    config: RelayConfig,
    /// Last observed mtime of the config file, for external-edit detection.
    modified: Option<SystemTime>,
    version_tx: watch::Sender<u64>,
}

impl ConfigStore {
    /// Open the config file, creating a default (empty) one if missing.
    pub fn open(path: PathBuf) -> Result<Self, RelayError> {
        let config = match std::fs::read_to_string(&path) {
            Ok(content) => RelayConfig::from_json(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = RelayConfig::default();
                atomic_write(&path, &config)?;
                tracing::info!(path = %path.display(), "created default configuration");
                config
            }
            Err(e) => {
                return Err(RelayError::Config(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };

        let modified = file_mtime(&path);
        let (version_tx, _) = watch::channel(config.version);
        Ok(Self {
            path,
            config,
            modified,
            version_tx,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// A by-value copy; what gets handed to workers.
    pub fn snapshot(&self) -> RelayConfig {
        self.config.clone()
    }

    pub fn version(&self) -> u64 {
        self.config.version
    }

    /// Subscribe to version bumps. The receiver's value is the current
    /// version at subscription time.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// Persist a mutated configuration: validate, bump the version counter,
    /// write atomically, and notify subscribers.
    pub fn save(&mut self, mut config: RelayConfig) -> Result<(), RelayError> {
        config.validate()?;
        config.version = self.config.version + 1;
        atomic_write(&self.path, &config)?;
        self.modified = file_mtime(&self.path);
        self.config = config;
        let _ = self.version_tx.send(self.config.version);
        Ok(())
    }

    /// Pick up an external edit of the config file, if any.
    ///
    /// Returns `true` when a changed, valid configuration was adopted. An
    /// invalid file is logged and ignored; the previous configuration stays
    /// in force.
    pub fn refresh(&mut self) -> bool {
        let mtime = file_mtime(&self.path);
        if mtime == self.modified {
            return false;
        }
        self.modified = mtime;

        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e,
                    "config file unreadable, keeping previous configuration");
                return false;
            }
        };

        match RelayConfig::from_json(&content) {
            Ok(mut config) => {
                if config == self.config {
                    return false;
                }
                // Keep the version monotonic even if the editor didn't bump it.
                if config.version <= self.config.version {
                    config.version = self.config.version + 1;
                }
                tracing::info!(version = config.version, "configuration reloaded from disk");
                self.config = config;
                let _ = self.version_tx.send(self.config.version);
                true
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e,
                    "rejected invalid configuration edit, keeping previous configuration");
                false
            }
        }
    }
}

fn file_mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
