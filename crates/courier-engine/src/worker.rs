//! Relay worker: the per-account forwarding loop.
//!
//! One worker owns one transport session and keeps every enabled channel
//! pair's target a filtered, transformed copy of its source. The loop is a
//! single `tokio::select!` over the shutdown signal, hot-reload channel,
//! the transport's event subscription, a fast poll tick, and a slower full
//! re-scan tick. Events are treated purely as wake signals: every actual
//! read goes through "messages newer than the checkpoint", so the loop
//! behaves identically whether the push stream is healthy or gone.
//!
//! Pair lifecycle: a pair without a backfill marker is pending; the
//! orchestrator runs it to completion (writing the marker) before the pair
//! joins the live set. Clearing the marker externally re-enters the pair
//! into the pending state at the next re-scan.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use courier_transport::{FeedEvent, ListQuery, Transport, TransportError};
use courier_types::{ChannelPair, RelayError, WorkerConfig};

use crate::backfill::{self, BackfillOutcome};
use crate::deletion;
use crate::filter::FilterPipeline;
use crate::forward::{group_messages, Forwarder, RelayOutcome};
use crate::store::WorkerStores;
use crate::transform::TransformPipeline;

/// How many album ids the dedup cache remembers.
const SEEN_GROUPS_CAP: usize = 100;

/// Page size for live polling reads.
const POLL_PAGE: usize = 100;

/// Errors that end a worker. All of these surface to the supervisor, which
/// decides between backoff restart, long-cooldown restart, and giving up.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("session storage is locked: {0}")]
    SessionLocked(String),

    #[error("feed {target} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        target: i64,
        attempts: u32,
        last: TransportError,
    },

    #[error(transparent)]
    State(#[from] RelayError),
}

impl WorkerError {
    /// Whether the crash signature indicates a session storage lock, which
    /// the supervisor treats with a longer restart cooldown.
    pub fn is_session_lock(&self) -> bool {
        matches!(self, Self::SessionLocked(_))
    }
}

/// Bounded remember-set for already-relayed album ids.
struct SeenGroups {
    set: HashSet<i64>,
    order: VecDeque<i64>,
}

impl SeenGroups {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn contains(&self, gid: i64) -> bool {
        self.set.contains(&gid)
    }

    fn remember(&mut self, gid: i64) {
        if self.set.insert(gid) {
            self.order.push_back(gid);
            while self.order.len() > SEEN_GROUPS_CAP {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }
}

/// One running relay worker.
pub struct Worker {
    config: WorkerConfig,
    transport: Arc<dyn Transport>,
    stores: WorkerStores,
    filter: FilterPipeline,
    transform: TransformPipeline,
    /// Pairs whose backfill is complete and which are being polled live.
    live: HashSet<(i64, i64)>,
    /// Pairs parked after a permission/restriction failure. Cleared on
    /// hot reload, which is the operator's lever to retry.
    skipped: HashSet<(i64, i64)>,
    seen_groups: SeenGroups,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        transport: Arc<dyn Transport>,
        stores: WorkerStores,
    ) -> Result<Self, WorkerError> {
        let filter = FilterPipeline::new(&config.filter);
        let transform = TransformPipeline::new(&config.rules)?;
        Ok(Self {
            config,
            transport,
            stores,
            filter,
            transform,
            live: HashSet::new(),
            skipped: HashSet::new(),
            seen_groups: SeenGroups::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Drive the worker until shutdown is requested or a fatal error occurs.
    pub async fn run(
        mut self,
        mut config_rx: watch::Receiver<WorkerConfig>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        info!(worker = self.id(), "worker starting");

        let mut events = match self.transport.subscribe_events().await {
            Ok(rx) => Some(rx),
            Err(TransportError::Auth(reason)) => return Err(WorkerError::Auth(reason)),
            Err(TransportError::SessionLocked(reason)) => {
                return Err(WorkerError::SessionLocked(reason))
            }
            Err(e) => {
                warn!(worker = self.id(), error = %e,
                    "event subscription unavailable, relying on polling");
                None
            }
        };

        self.prepare_pairs().await?;

        let mut poll = self.make_interval(self.config.settings.poll_interval_secs);
        let mut rescan = self.make_interval(self.config.settings.rescan_interval_secs);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(worker = self.id(), "shutdown requested");
                        break;
                    }
                }
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        // Supervisor dropped the channel; treat as shutdown.
                        break;
                    }
                    let new_config = config_rx.borrow_and_update().clone();
                    info!(worker = self.id(), "applying hot configuration reload");
                    self.apply_config(new_config)?;
                    self.prepare_pairs().await?;
                    poll = self.make_interval(self.config.settings.poll_interval_secs);
                    rescan = self.make_interval(self.config.settings.rescan_interval_secs);
                }
                event = recv_event(&mut events) => {
                    match event {
                        Some(FeedEvent::NewMessage { feed, .. }) => {
                            self.poll_source(feed).await?;
                        }
                        Some(FeedEvent::Deleted { feed, message_ids }) => {
                            self.sync_deletions(feed, &message_ids).await?;
                        }
                        None => {
                            warn!(worker = self.id(),
                                "event stream closed, relying on polling");
                            events = None;
                        }
                    }
                }
                _ = poll.tick() => {
                    self.poll_all().await?;
                }
                _ = rescan.tick() => {
                    self.prepare_pairs().await?;
                }
            }
        }

        // Cooperative shutdown: the in-flight delivery already finished
        // (we only observe the signal between units); flush and return.
        self.stores.flush()?;
        info!(worker = self.id(), "worker stopped");
        Ok(())
    }

    fn make_interval(&self, secs: u64) -> tokio::time::Interval {
        let mut ticker = interval(Duration::from_secs(secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Swap in a new configuration wholesale: rebuild both pipelines, drop
    /// live state for pairs that no longer exist, and un-park skipped pairs
    /// so the operator's edit acts as the retry trigger.
    fn apply_config(&mut self, config: WorkerConfig) -> Result<(), WorkerError> {
        self.filter = FilterPipeline::new(&config.filter);
        self.transform = TransformPipeline::new(&config.rules)?;
        self.config = config;

        let configured: HashSet<(i64, i64)> =
            self.config.enabled_pairs().map(|p| p.key()).collect();
        self.live.retain(|key| configured.contains(key));
        self.skipped.clear();
        Ok(())
    }

    /// Reconcile the pair set: initialize checkpoints for new sources, run
    /// pending backfills, and admit completed pairs into the live set.
    async fn prepare_pairs(&mut self) -> Result<(), WorkerError> {
        let pairs: Vec<ChannelPair> = self.config.enabled_pairs().cloned().collect();

        let configured: HashSet<(i64, i64)> = pairs.iter().map(|p| p.key()).collect();
        self.live.retain(|key| configured.contains(key));

        for pair in pairs {
            let key = pair.key();
            if self.skipped.contains(&key) {
                continue;
            }

            if !self.stores.checkpoints.contains(pair.source) {
                self.init_checkpoint(pair.source).await?;
            }

            if self.stores.backfill.is_complete(pair.source, pair.target) {
                if self.live.insert(key) {
                    info!(
                        worker = self.id(),
                        source = pair.source,
                        target = pair.target,
                        "pair live"
                    );
                }
                continue;
            }

            // Pending backfill: the pair only goes live once the marker is
            // written.
            self.live.remove(&key);
            info!(
                worker = self.id(),
                source = pair.source,
                target = pair.target,
                backfill_count = pair.backfill_count,
                "backfill starting"
            );
            let forwarder = Forwarder {
                worker_id: &self.config.id,
                transport: self.transport.as_ref(),
                filter: &self.filter,
                transform: &self.transform,
                settings: &self.config.settings,
            };
            let outcome = backfill::run(
                &forwarder,
                &mut self.stores.checkpoints,
                &mut self.stores.deletions,
                &pair,
            )
            .await?;

            match outcome {
                BackfillOutcome::Completed => {
                    self.stores
                        .backfill
                        .mark_complete(pair.source, pair.target, chrono::Utc::now().timestamp());
                    self.stores.flush()?;
                    self.live.insert(key);
                    info!(
                        worker = self.id(),
                        source = pair.source,
                        target = pair.target,
                        "backfill complete, pair live"
                    );
                }
                BackfillOutcome::PermissionSkipped | BackfillOutcome::Restricted => {
                    self.skipped.insert(key);
                    self.stores.flush()?;
                    warn!(
                        worker = self.id(),
                        source = pair.source,
                        target = pair.target,
                        "backfill aborted, pair parked until operator intervenes"
                    );
                }
            }
        }
        Ok(())
    }

    /// First sight of a source: start at the live tail so enabling a pair
    /// does not replay history outside an explicit backfill.
    async fn init_checkpoint(&mut self, source: i64) -> Result<(), WorkerError> {
        let forwarder = Forwarder {
            worker_id: &self.config.id,
            transport: self.transport.as_ref(),
            filter: &self.filter,
            transform: &self.transform,
            settings: &self.config.settings,
        };
        let newest = forwarder.list_with_retry(source, ListQuery::newest(1)).await?;
        let tail = newest.first().map(|m| m.id).unwrap_or(0);
        self.stores.checkpoints.advance(source, tail);
        self.stores.checkpoints.save()?;
        info!(worker = self.id(), source, tail, "checkpoint initialized");
        Ok(())
    }

    /// Poll every live pair once.
    async fn poll_all(&mut self) -> Result<(), WorkerError> {
        let pairs: Vec<ChannelPair> = self
            .config
            .enabled_pairs()
            .filter(|p| self.live.contains(&p.key()))
            .cloned()
            .collect();
        for pair in pairs {
            self.poll_pair(&pair).await?;
        }
        Ok(())
    }

    /// Poll the live pairs fed by one source (event fast path).
    async fn poll_source(&mut self, source: i64) -> Result<(), WorkerError> {
        let pairs: Vec<ChannelPair> = self
            .config
            .enabled_pairs()
            .filter(|p| p.source == source && self.live.contains(&p.key()))
            .cloned()
            .collect();
        for pair in pairs {
            self.poll_pair(&pair).await?;
        }
        Ok(())
    }

    /// Relay everything newer than the checkpoint for one pair.
    async fn poll_pair(&mut self, pair: &ChannelPair) -> Result<(), WorkerError> {
        if self.skipped.contains(&pair.key()) {
            return Ok(());
        }

        let after = self.stores.checkpoints.get(pair.source).unwrap_or(0);
        let batch = match self
            .transport
            .list_messages(pair.source, ListQuery::after(after, POLL_PAGE))
            .await
        {
            Ok(batch) => batch,
            Err(TransportError::FloodWait { wait }) => {
                let forwarder = self.forwarder();
                forwarder.pause_for_flood(wait).await;
                return Ok(());
            }
            Err(TransportError::Auth(reason)) => return Err(WorkerError::Auth(reason)),
            Err(TransportError::SessionLocked(reason)) => {
                return Err(WorkerError::SessionLocked(reason))
            }
            Err(e) => {
                // Transient listing failures just wait for the next tick.
                warn!(worker = self.id(), source = pair.source, error = %e,
                    "polling failed, will retry on next tick");
                return Ok(());
            }
        };

        if batch.is_empty() {
            return Ok(());
        }

        for group in group_messages(batch) {
            let Some(last_id) = group.last().map(|m| m.id) else {
                continue;
            };

            if let Some(gid) = group.first().and_then(|m| m.grouped_id) {
                if self.seen_groups.contains(gid) {
                    debug!(worker = self.id(), source = pair.source, group = gid,
                        "album already relayed, advancing past remainder");
                    self.stores.checkpoints.advance(pair.source, last_id);
                    continue;
                }
            }

            let forwarder = Forwarder {
                worker_id: &self.config.id,
                transport: self.transport.as_ref(),
                filter: &self.filter,
                transform: &self.transform,
                settings: &self.config.settings,
            };
            let outcome = forwarder
                .relay_group(pair.source, pair.target, &group, &mut self.stores.deletions)
                .await?;

            match outcome {
                RelayOutcome::Delivered { .. } => {
                    if let Some(gid) = group.first().and_then(|m| m.grouped_id) {
                        self.seen_groups.remember(gid);
                    }
                    self.stores.checkpoints.advance(pair.source, last_id);
                }
                RelayOutcome::Filtered | RelayOutcome::Dropped => {
                    self.stores.checkpoints.advance(pair.source, last_id);
                }
                RelayOutcome::PermissionSkipped | RelayOutcome::Restricted => {
                    // Checkpoint held so the messages can be retried once
                    // the operator fixes the pair.
                    self.skipped.insert(pair.key());
                    break;
                }
            }
        }

        self.stores.checkpoints.save()?;
        self.stores.deletions.save()?;
        Ok(())
    }

    /// Propagate a batch of source deletions to the target feeds.
    async fn sync_deletions(&mut self, source: i64, ids: &[i64]) -> Result<(), WorkerError> {
        deletion::sync(
            &self.config.id,
            self.transport.as_ref(),
            &mut self.stores.deletions,
            &self.config.settings,
            source,
            ids,
        )
        .await
    }

    fn forwarder(&self) -> Forwarder<'_> {
        Forwarder {
            worker_id: &self.config.id,
            transport: self.transport.as_ref(),
            filter: &self.filter,
            transform: &self.transform,
            settings: &self.config.settings,
        }
    }
}

/// Receive from an optional event stream; a missing stream never resolves.
async fn recv_event(events: &mut Option<mpsc::Receiver<FeedEvent>>) -> Option<FeedEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_transport::{MemoryTransport, Message, MessagePayload, Outbound};
    use courier_types::{FilterConfig, FilterMode, RelaySettings, ReplacementRule};

    fn test_pair(source: i64, target: i64, backfill_count: i64) -> ChannelPair {
        ChannelPair {
            source,
            target,
            enabled: true,
            backfill_count,
        }
    }

    fn test_config(pairs: Vec<ChannelPair>) -> WorkerConfig {
        WorkerConfig {
            id: "w1".into(),
            session: "w1-session".into(),
            enabled: true,
            pairs,
            rules: vec![],
            filter: FilterConfig::default(),
            settings: RelaySettings {
                retry_delay_secs: 0,
                backfill_batch_delay_ms: 0,
                ..Default::default()
            },
        }
    }

    fn worker_with(
        transport: Arc<MemoryTransport>,
        config: WorkerConfig,
        dir: &std::path::Path,
    ) -> Worker {
        let stores = WorkerStores::open(dir, &config.id);
        Worker::new(config, transport, stores).unwrap()
    }

    #[tokio::test]
    async fn new_source_checkpoint_starts_at_live_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.seed(-1001, vec![Message::text(1, "old"), Message::text(2, "older")]);

        let config = test_config(vec![test_pair(-1001, -2001, -1)]);
        let mut worker = worker_with(transport.clone(), config, tmp.path());
        worker.prepare_pairs().await.unwrap();

        // History before the tail is not replayed by live polling.
        worker.poll_all().await.unwrap();
        assert!(transport.sent(-2001).is_empty());
        assert_eq!(worker.stores.checkpoints.get(-1001), Some(2));
    }

    #[tokio::test]
    async fn live_poll_relays_new_messages_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.seed(-1001, vec![Message::text(10, "tail")]);

        let config = test_config(vec![test_pair(-1001, -2001, -1)]);
        let mut worker = worker_with(transport.clone(), config, tmp.path());
        worker.prepare_pairs().await.unwrap();

        transport.append(-1001, Message::text(11, "first"));
        transport.append(-1001, Message::text(12, "second"));
        worker.poll_all().await.unwrap();

        let sent = transport.sent(-2001);
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0].1,
            Outbound::Single(MessagePayload::Text {
                text: "first".into()
            })
        );
        assert_eq!(worker.stores.checkpoints.get(-1001), Some(12));

        // Nothing new: polling again is a no-op.
        worker.poll_all().await.unwrap();
        assert_eq!(transport.sent(-2001).len(), 2);
    }

    #[tokio::test]
    async fn transform_rules_are_applied_to_relayed_text() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.seed(-1001, vec![Message::text(1, "tail")]);

        let mut config = test_config(vec![test_pair(-1001, -2001, -1)]);
        config.rules = vec![ReplacementRule {
            find: "secret".into(),
            replace: "[redacted]".into(),
            case_sensitive: false,
            is_regex: false,
        }];
        let mut worker = worker_with(transport.clone(), config, tmp.path());
        worker.prepare_pairs().await.unwrap();

        transport.append(-1001, Message::text(2, "the SECRET plan"));
        worker.poll_all().await.unwrap();

        let sent = transport.sent(-2001);
        assert_eq!(
            sent[0].1,
            Outbound::Single(MessagePayload::Text {
                text: "the [redacted] plan".into()
            })
        );
    }

    #[tokio::test]
    async fn filtered_message_advances_checkpoint_without_delivery() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.seed(-1001, vec![Message::text(1, "tail")]);

        let mut config = test_config(vec![test_pair(-1001, -2001, -1)]);
        config.filter = FilterConfig {
            enabled: true,
            mode: FilterMode::Whitelist,
            keywords: vec!["GOLD".into(), "BUY".into()],
        };
        let mut worker = worker_with(transport.clone(), config, tmp.path());
        worker.prepare_pairs().await.unwrap();

        transport.append(-1001, Message::text(2, "SELL now"));
        transport.append(-1001, Message::text(3, "BUY GOLD now"));
        worker.poll_all().await.unwrap();

        let sent = transport.sent(-2001);
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].1,
            Outbound::Single(MessagePayload::Text {
                text: "BUY GOLD now".into()
            })
        );
        // The rejected message still advanced the checkpoint.
        assert_eq!(worker.stores.checkpoints.get(-1001), Some(3));
    }

    #[tokio::test]
    async fn album_is_delivered_as_one_unit() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.seed(-1001, vec![Message::text(1, "tail")]);

        let config = test_config(vec![test_pair(-1001, -2001, -1)]);
        let mut worker = worker_with(transport.clone(), config, tmp.path());
        worker.prepare_pairs().await.unwrap();

        for (id, caption) in [(2, Some("album cap".to_string())), (3, None), (4, None)] {
            transport.append(
                -1001,
                Message {
                    id,
                    grouped_id: Some(900),
                    payload: MessagePayload::Photo { caption },
                },
            );
        }
        worker.poll_all().await.unwrap();

        let sent = transport.sent(-2001);
        assert_eq!(sent.len(), 1);
        match &sent[0].1 {
            Outbound::Album(items) => assert_eq!(items.len(), 3),
            other => panic!("expected album, got {other:?}"),
        }
        assert_eq!(worker.stores.checkpoints.get(-1001), Some(4));

        // Every album member maps to the delivered target message.
        let target_msg = sent[0].0;
        for source_id in [2, 3, 4] {
            assert_eq!(
                worker
                    .stores
                    .deletions
                    .lookup(-1001, source_id)
                    .unwrap()
                    .target_msg_id,
                target_msg
            );
        }
    }

    #[tokio::test]
    async fn permission_error_parks_pair_and_holds_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.seed(-1001, vec![Message::text(1, "tail")]);

        let config = test_config(vec![test_pair(-1001, -2001, -1)]);
        let mut worker = worker_with(transport.clone(), config, tmp.path());
        worker.prepare_pairs().await.unwrap();

        transport.fail_sends_to(-2001, TransportError::PermissionDenied { feed: -2001 });
        transport.append(-1001, Message::text(2, "held"));
        worker.poll_all().await.unwrap();

        assert!(transport.sent(-2001).is_empty());
        assert_eq!(worker.stores.checkpoints.get(-1001), Some(1));
        assert!(worker.skipped.contains(&(-1001, -2001)));

        // Hot reload (operator intervention) un-parks the pair.
        transport.clear_send_fault(-2001);
        let config = test_config(vec![test_pair(-1001, -2001, -1)]);
        worker.apply_config(config).unwrap();
        worker.prepare_pairs().await.unwrap();
        worker.poll_all().await.unwrap();
        assert_eq!(transport.sent(-2001).len(), 1);
    }

    #[tokio::test]
    async fn transient_send_errors_are_retried_until_success() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.seed(-1001, vec![Message::text(1, "tail")]);

        let config = test_config(vec![test_pair(-1001, -2001, -1)]);
        let mut worker = worker_with(transport.clone(), config, tmp.path());
        worker.prepare_pairs().await.unwrap();

        transport.fail_next_send(TransportError::Network("reset".into()));
        transport.fail_next_send(TransportError::Network("reset".into()));
        transport.append(-1001, Message::text(2, "eventually"));
        worker.poll_all().await.unwrap();

        assert_eq!(transport.sent(-2001).len(), 1);
        assert_eq!(transport.send_calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_escalate_to_worker_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.seed(-1001, vec![Message::text(1, "tail")]);

        let mut config = test_config(vec![test_pair(-1001, -2001, -1)]);
        config.settings.retry_attempts = 2;
        let mut worker = worker_with(transport.clone(), config, tmp.path());
        worker.prepare_pairs().await.unwrap();

        transport.fail_sends_to(-2001, TransportError::Network("down".into()));
        transport.append(-1001, Message::text(2, "x"));
        let err = worker.poll_all().await.unwrap_err();
        assert!(matches!(err, WorkerError::RetriesExhausted { .. }));
    }

    #[tokio::test]
    async fn auth_failure_is_fatal_to_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.seed(-1001, vec![Message::text(1, "tail")]);

        let config = test_config(vec![test_pair(-1001, -2001, -1)]);
        let mut worker = worker_with(transport.clone(), config, tmp.path());
        worker.prepare_pairs().await.unwrap();

        transport.fail_next_send(TransportError::Auth("session revoked".into()));
        transport.append(-1001, Message::text(2, "x"));
        let err = worker.poll_all().await.unwrap_err();
        assert!(matches!(err, WorkerError::Auth(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn flood_wait_pauses_for_mandated_duration_plus_buffer() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.seed(-1001, vec![Message::text(1, "tail")]);

        let mut config = test_config(vec![test_pair(-1001, -2001, -1)]);
        config.settings.flood_wait_extra_delay_secs = 10;
        let mut worker = worker_with(transport.clone(), config, tmp.path());
        worker.prepare_pairs().await.unwrap();

        transport.fail_next_send(TransportError::FloodWait {
            wait: Duration::from_secs(30),
        });
        transport.append(-1001, Message::text(2, "x"));

        let started = tokio::time::Instant::now();
        worker.poll_all().await.unwrap();
        let elapsed = started.elapsed();

        // Resumed no earlier than wait + buffer, and within one tick of it.
        assert!(elapsed >= Duration::from_secs(40));
        assert!(elapsed < Duration::from_secs(41));
        assert_eq!(transport.sent(-2001).len(), 1);
    }

    #[tokio::test]
    async fn deletion_event_removes_target_message() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.seed(-1001, vec![Message::text(1, "tail")]);

        let config = test_config(vec![test_pair(-1001, -2001, -1)]);
        let mut worker = worker_with(transport.clone(), config, tmp.path());
        worker.prepare_pairs().await.unwrap();

        transport.append(-1001, Message::text(12345, "to be deleted"));
        worker.poll_all().await.unwrap();
        let target_msg = transport.sent(-2001)[0].0;

        worker.sync_deletions(-1001, &[12345]).await.unwrap();
        assert!(transport.sent(-2001).is_empty());
        assert!(worker.stores.deletions.lookup(-1001, 12345).is_none());

        // A repeat event is a no-op: no mapping, no transport call.
        worker.sync_deletions(-1001, &[12345]).await.unwrap();
        let _ = target_msg;
    }

    #[tokio::test]
    async fn disabled_pair_is_not_polled() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.seed(-1001, vec![Message::text(1, "tail")]);

        let mut pair = test_pair(-1001, -2001, -1);
        pair.enabled = false;
        let config = test_config(vec![pair]);
        let mut worker = worker_with(transport.clone(), config, tmp.path());
        worker.prepare_pairs().await.unwrap();

        transport.append(-1001, Message::text(2, "x"));
        worker.poll_all().await.unwrap();
        assert!(transport.sent(-2001).is_empty());
    }

    #[tokio::test]
    async fn run_loop_shuts_down_cooperatively() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.seed(-1001, vec![Message::text(1, "tail")]);

        let config = test_config(vec![test_pair(-1001, -2001, -1)]);
        let worker = worker_with(transport.clone(), config.clone(), tmp.path());

        let (_config_tx, config_rx) = watch::channel(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(worker.run(config_rx, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), join)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn seen_groups_cache_is_bounded() {
        let mut seen = SeenGroups::new();
        for gid in 0..(SEEN_GROUPS_CAP as i64 + 50) {
            seen.remember(gid);
        }
        assert!(!seen.contains(0));
        assert!(seen.contains(SEEN_GROUPS_CAP as i64 + 49));
        assert_eq!(seen.set.len(), SEEN_GROUPS_CAP);
    }
}
