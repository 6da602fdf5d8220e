//! Configuration schema for the courier relay.
//!
//! [`RelayConfig`] is the top-level document loaded from `config.json`. It
//! holds one [`WorkerConfig`] per account identity; each worker carries its
//! own channel pairs, replacement rules, filter settings, and reliability
//! tuning. The engine receives worker configuration by value and is handed a
//! fresh copy on every reload, so a running worker never aliases the mutable
//! store.

use serde::{Deserialize, Serialize};

use crate::RelayError;

/// Keyword filter mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Relay only messages containing at least one keyword.
    Whitelist,
    /// Relay only messages containing none of the keywords.
    Blacklist,
}

/// Keyword filtering applied before a message is relayed.
///
/// Matching is a case-insensitive substring check against the message text
/// or caption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterConfig {
    pub enabled: bool,
    pub mode: FilterMode,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: FilterMode::Whitelist,
            keywords: Vec::new(),
        }
    }
}

/// A find/replace rule applied to message text and captions.
///
/// When `is_regex` is set, `find` must compile as a valid pattern; this is
/// checked by [`RelayConfig::validate`] so a bad pattern is rejected when
/// the configuration is mutated, never inside the forwarding loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplacementRule {
    pub find: String,
    pub replace: String,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub is_regex: bool,
}

/// One `source -> target` feed mapping owned by a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelPair {
    /// Source feed id messages are read from.
    pub source: i64,
    /// Target feed id messages are delivered to.
    pub target: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Historical backfill depth: `0` copies the full history, `N > 0`
    /// copies the most recent N messages, negative skips backfill entirely.
    #[serde(default)]
    pub backfill_count: i64,
}

impl ChannelPair {
    /// Stable key used by the persisted backfill ledger.
    pub fn key(&self) -> (i64, i64) {
        (self.source, self.target)
    }
}

/// Reliability and pacing knobs for one worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySettings {
    /// Delivery attempts before a transient failure escalates.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base delay for exponential delivery backoff, in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Buffer added on top of a server-mandated rate-limit wait, in seconds.
    #[serde(default = "default_flood_extra")]
    pub flood_wait_extra_delay_secs: u64,
    /// Fast-path cadence: poll live pairs and check for reloads, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Full periodic re-scan of the pair set, in seconds.
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_secs: u64,
    /// Page size for full-history backfill.
    #[serde(default = "default_backfill_batch")]
    pub backfill_batch_size: usize,
    /// Pause between backfill batches, in milliseconds.
    #[serde(default = "default_backfill_delay")]
    pub backfill_batch_delay_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_retry_attempts() -> u32 {
    5
}
fn default_retry_delay() -> u64 {
    5
}
fn default_flood_extra() -> u64 {
    10
}
fn default_poll_interval() -> u64 {
    5
}
fn default_rescan_interval() -> u64 {
    120
}
fn default_backfill_batch() -> usize {
    100
}
fn default_backfill_delay() -> u64 {
    1000
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay(),
            flood_wait_extra_delay_secs: default_flood_extra(),
            poll_interval_secs: default_poll_interval(),
            rescan_interval_secs: default_rescan_interval(),
            backfill_batch_size: default_backfill_batch(),
            backfill_batch_delay_ms: default_backfill_delay(),
        }
    }
}

/// Configuration for one relay worker (one account identity).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Unique identity key, also used to name the worker's state directory.
    pub id: String,
    /// Transport credentials reference (session name understood by the
    /// transport connector). Changing this requires a full worker restart.
    pub session: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub pairs: Vec<ChannelPair>,
    #[serde(default)]
    pub rules: Vec<ReplacementRule>,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub settings: RelaySettings,
}

impl WorkerConfig {
    /// Whether `other` can be applied to a running worker in place.
    ///
    /// Identity and credentials pin the transport session; everything else
    /// (pairs, rules, filter, settings) is hot-reloadable.
    pub fn hot_reloadable_from(&self, other: &WorkerConfig) -> bool {
        self.id == other.id && self.session == other.session
    }

    /// Enabled pairs in configuration order.
    pub fn enabled_pairs(&self) -> impl Iterator<Item = &ChannelPair> {
        self.pairs.iter().filter(|p| p.enabled)
    }
}

/// Top-level relay configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    /// Monotonic version counter, bumped by every administrative mutation.
    /// Observed by the supervisor as the reload signal.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

impl RelayConfig {
    /// Parse a configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self, RelayError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, RelayError> {
        serde_json::to_string_pretty(self).map_err(|e| RelayError::Config(e.to_string()))
    }

    /// Look up a worker by id.
    pub fn worker(&self, id: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.id == id)
    }

    /// Workers the supervisor should be running.
    pub fn enabled_workers(&self) -> impl Iterator<Item = &WorkerConfig> {
        self.workers.iter().filter(|w| w.enabled)
    }

    /// Validate structural invariants that must never reach the engine:
    /// non-empty unique worker ids, non-empty sessions, unique pairs per
    /// worker, and regex rules that actually compile.
    pub fn validate(&self) -> Result<(), RelayError> {
        let mut ids = std::collections::HashSet::new();
        for worker in &self.workers {
            if worker.id.trim().is_empty() {
                return Err(RelayError::Config("worker id must not be empty".into()));
            }
            if !ids.insert(worker.id.as_str()) {
                return Err(RelayError::Config(format!(
                    "duplicate worker id: {}",
                    worker.id
                )));
            }
            if worker.session.trim().is_empty() {
                return Err(RelayError::Config(format!(
                    "worker {} has an empty session reference",
                    worker.id
                )));
            }

            let mut pair_keys = std::collections::HashSet::new();
            for pair in &worker.pairs {
                if !pair_keys.insert(pair.key()) {
                    return Err(RelayError::Config(format!(
                        "worker {} has duplicate pair {} -> {}",
                        worker.id, pair.source, pair.target
                    )));
                }
            }

            for rule in &worker.rules {
                if rule.find.is_empty() {
                    return Err(RelayError::Rule {
                        find: rule.find.clone(),
                        reason: "find pattern must not be empty".into(),
                    });
                }
                if rule.is_regex {
                    regex::Regex::new(&rule.find).map_err(|e| RelayError::Rule {
                        find: rule.find.clone(),
                        reason: e.to_string(),
                    })?;
                }
            }

            if worker.settings.retry_attempts == 0 {
                return Err(RelayError::Config(format!(
                    "worker {} has retry_attempts of 0",
                    worker.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(source: i64, target: i64) -> ChannelPair {
        ChannelPair {
            source,
            target,
            enabled: true,
            backfill_count: 0,
        }
    }

    fn worker(id: &str) -> WorkerConfig {
        WorkerConfig {
            id: id.into(),
            session: format!("{id}-session"),
            enabled: true,
            pairs: vec![pair(-1001, -1002)],
            rules: vec![],
            filter: FilterConfig::default(),
            settings: RelaySettings::default(),
        }
    }

    #[test]
    fn config_json_roundtrip() {
        let config = RelayConfig {
            version: 7,
            workers: vec![worker("alpha"), worker("beta")],
        };

        let json = config.to_json().unwrap();
        let parsed = RelayConfig::from_json(&json).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.version, 7);
    }

    #[test]
    fn defaults_applied_for_sparse_json() {
        let json = r#"{
            "workers": [{
                "id": "w1",
                "session": "w1-session",
                "pairs": [{"source": -1001, "target": -1002}]
            }]
        }"#;
        let config = RelayConfig::from_json(json).unwrap();
        let w = config.worker("w1").unwrap();

        assert!(w.enabled);
        assert!(w.pairs[0].enabled);
        assert_eq!(w.pairs[0].backfill_count, 0);
        assert_eq!(w.settings.retry_attempts, 5);
        assert_eq!(w.settings.retry_delay_secs, 5);
        assert_eq!(w.settings.flood_wait_extra_delay_secs, 10);
        assert_eq!(w.settings.poll_interval_secs, 5);
        assert!(!w.filter.enabled);
    }

    #[test]
    fn validate_rejects_duplicate_worker_ids() {
        let config = RelayConfig {
            version: 0,
            workers: vec![worker("same"), worker("same")],
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate worker id"));
    }

    #[test]
    fn validate_rejects_duplicate_pairs() {
        let mut w = worker("w1");
        w.pairs = vec![pair(1, 2), pair(1, 2)];
        let config = RelayConfig {
            version: 0,
            workers: vec![w],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_invalid_regex_rule() {
        let mut w = worker("w1");
        w.rules = vec![ReplacementRule {
            find: "(unclosed".into(),
            replace: "".into(),
            case_sensitive: false,
            is_regex: true,
        }];
        let config = RelayConfig {
            version: 0,
            workers: vec![w],
        };
        let err = config.validate().unwrap_err();
        match err {
            RelayError::Rule { find, .. } => assert_eq!(find, "(unclosed"),
            other => panic!("expected Rule error, got {other}"),
        }
    }

    #[test]
    fn validate_accepts_literal_rule_with_regex_metacharacters() {
        let mut w = worker("w1");
        w.rules = vec![ReplacementRule {
            find: "(unclosed".into(),
            replace: "".into(),
            case_sensitive: false,
            is_regex: false,
        }];
        let config = RelayConfig {
            version: 0,
            workers: vec![w],
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_session() {
        let mut w = worker("w1");
        w.session = "  ".into();
        let config = RelayConfig {
            version: 0,
            workers: vec![w],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn hot_reloadable_tracks_identity_and_session() {
        let a = worker("w1");
        let mut b = worker("w1");
        b.filter.enabled = true;
        assert!(a.hot_reloadable_from(&b));

        b.session = "other-session".into();
        assert!(!a.hot_reloadable_from(&b));
    }

    #[test]
    fn enabled_workers_skips_disabled() {
        let mut off = worker("off");
        off.enabled = false;
        let config = RelayConfig {
            version: 0,
            workers: vec![worker("on"), off],
        };
        let ids: Vec<&str> = config.enabled_workers().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["on"]);
    }

    #[test]
    fn negative_backfill_count_parses() {
        let json = r#"{"source": 1, "target": 2, "backfill_count": -1}"#;
        let p: ChannelPair = serde_json::from_str(json).unwrap();
        assert_eq!(p.backfill_count, -1);
        assert!(p.enabled);
    }
}
