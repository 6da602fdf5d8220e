//! Supervisor: reconciles running workers against the live configuration.
//!
//! Owns one slot per configured worker id. On a timer and on every config
//! version bump it diffs the desired set (enabled workers) against the
//! running set: starts the missing, stops the removed, hot-reloads in-place
//! edits, and fully restarts workers whose credentials changed. Crashed
//! workers restart with exponential backoff -- with a materially longer
//! cooldown when the crash signature is a session storage lock, since
//! hammering a still-locked session loops forever. After too many
//! consecutive failures a worker is left stopped and surfaced as a hard
//! failure.
//!
//! The slot map is also the single-instance lease: one slot per worker id
//! means two sessions are never opened against the same identity.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use courier_transport::{Connector, TransportError};
use courier_types::WorkerConfig;

use crate::store::{ConfigStore, WorkerStores};
use crate::worker::{Worker, WorkerError};

/// Reconcile/housekeeping cadence.
const TICK_SECS: u64 = 5;
/// Upper bound for crash backoff.
const MAX_BACKOFF_SECS: u64 = 60;
/// Cooldown floor when the crash signature is a session lock.
const LOCK_COOLDOWN_SECS: u64 = 30;
/// Consecutive failed restarts before a worker is declared failed.
const DEFAULT_MAX_RESTARTS: u32 = 5;
/// Grace period for a worker to finish its in-flight unit on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Externally visible state of one worker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    /// Crashed; restarting once the cooldown elapses.
    BackingOff { restarts: u32 },
    /// Gave up after too many consecutive failures.
    Failed { restarts: u32 },
    Stopped,
}

struct WorkerHandle {
    config_tx: watch::Sender<WorkerConfig>,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<Result<(), WorkerError>>,
}

struct WorkerSlot {
    config: WorkerConfig,
    handle: Option<WorkerHandle>,
    restart_count: u32,
    backoff_until: Option<Instant>,
    failed: bool,
}

impl WorkerSlot {
    fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            handle: None,
            restart_count: 0,
            backoff_until: None,
            failed: false,
        }
    }

    fn status(&self) -> WorkerStatus {
        if self.handle.is_some() {
            WorkerStatus::Running
        } else if self.failed {
            WorkerStatus::Failed {
                restarts: self.restart_count,
            }
        } else if self.backoff_until.is_some() {
            WorkerStatus::BackingOff {
                restarts: self.restart_count,
            }
        } else {
            WorkerStatus::Stopped
        }
    }
}

pub struct Supervisor {
    store: ConfigStore,
    state_dir: PathBuf,
    connector: Arc<dyn Connector>,
    slots: HashMap<String, WorkerSlot>,
    max_restarts: u32,
}

impl Supervisor {
    pub fn new(store: ConfigStore, state_dir: PathBuf, connector: Arc<dyn Connector>) -> Self {
        Self {
            store,
            state_dir,
            connector,
            slots: HashMap::new(),
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }

    /// Override the consecutive-failure ceiling.
    #[must_use]
    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    /// Status snapshot of every slot, sorted by worker id.
    pub fn status(&self) -> Vec<(String, WorkerStatus)> {
        let mut rows: Vec<(String, WorkerStatus)> = self
            .slots
            .iter()
            .map(|(id, slot)| (id.clone(), slot.status()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Drive the supervisor until the shutdown signal fires, then stop all
    /// workers gracefully.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut reload_rx = self.store.subscribe();
        let mut tick = interval(Duration::from_secs(TICK_SECS));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("supervisor starting");
        self.reconcile().await;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("shutdown requested, stopping all workers");
                        break;
                    }
                }
                changed = reload_rx.changed() => {
                    if changed.is_ok() {
                        info!(version = self.store.version(), "reload signal observed");
                        self.reconcile().await;
                    }
                }
                _ = tick.tick() => {
                    if self.store.refresh() {
                        self.reconcile().await;
                    }
                    self.tick().await;
                }
            }
        }

        self.stop_all().await;
        info!("supervisor stopped");
    }

    /// Diff the enabled worker set against the slots and converge.
    pub async fn reconcile(&mut self) {
        let desired: HashMap<String, WorkerConfig> = self
            .store
            .config()
            .enabled_workers()
            .map(|w| (w.id.clone(), w.clone()))
            .collect();

        // Stop workers that are no longer configured or were disabled.
        let to_stop: Vec<String> = self
            .slots
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for id in to_stop {
            info!(worker = %id, "worker removed from configuration, stopping");
            self.stop_worker(&id).await;
            self.slots.remove(&id);
        }

        for (id, config) in desired {
            enum Action {
                Start,
                Restart(Box<WorkerConfig>),
                Nothing,
            }

            // Decide while the slot is borrowed, act afterwards.
            let action = match self.slots.get_mut(&id) {
                None => {
                    self.slots.insert(id.clone(), WorkerSlot::new(config));
                    Action::Start
                }
                Some(slot) if slot.config == config => Action::Nothing,
                Some(slot) if slot.config.hot_reloadable_from(&config) => {
                    info!(worker = %id, "configuration changed, hot reloading");
                    slot.config = config.clone();
                    // A config edit also clears a hard failure: the
                    // operator intervened.
                    slot.failed = false;
                    slot.restart_count = 0;
                    match &slot.handle {
                        Some(handle) => {
                            let _ = handle.config_tx.send(config);
                            Action::Nothing
                        }
                        None if slot.backoff_until.is_none() => Action::Start,
                        None => Action::Nothing,
                    }
                }
                Some(_) => Action::Restart(Box::new(config)),
            };

            match action {
                Action::Start => self.start_worker(&id).await,
                Action::Restart(config) => {
                    info!(worker = %id, "credentials changed, restarting session");
                    self.stop_worker(&id).await;
                    if let Some(slot) = self.slots.get_mut(&id) {
                        slot.config = *config;
                        slot.restart_count = 0;
                        slot.failed = false;
                        slot.backoff_until = None;
                    }
                    self.start_worker(&id).await;
                }
                Action::Nothing => {}
            }
        }
    }

    /// Housekeeping: reap crashed workers and restart slots whose backoff
    /// expired.
    pub async fn tick(&mut self) {
        let ids: Vec<String> = self.slots.keys().cloned().collect();
        for id in &ids {
            let finished = self
                .slots
                .get(id)
                .and_then(|s| s.handle.as_ref())
                .is_some_and(|h| h.join.is_finished());
            if finished {
                self.reap_worker(id).await;
            }
        }

        let now = Instant::now();
        for id in ids {
            let ready = self
                .slots
                .get(&id)
                .is_some_and(|s| s.handle.is_none() && !s.failed
                    && s.backoff_until.is_some_and(|t| now >= t));
            if ready {
                if let Some(slot) = self.slots.get_mut(&id) {
                    slot.backoff_until = None;
                }
                info!(worker = %id, "backoff expired, restarting worker");
                self.start_worker(&id).await;
            }
        }
    }

    /// Start the worker in a slot. The slot map is the single-instance
    /// lease: a slot with a live handle is never started twice.
    async fn start_worker(&mut self, id: &str) {
        let Some(slot) = self.slots.get_mut(id) else {
            warn!(worker = %id, "start requested for unknown worker");
            return;
        };
        if slot.handle.is_some() {
            warn!(worker = %id, "worker already running, refusing second instance");
            return;
        }
        if slot.failed {
            return;
        }
        let config = slot.config.clone();

        let transport = match self.connector.connect(&config.session).await {
            Ok(transport) => transport,
            Err(e) => {
                error!(worker = %id, error = %e, "failed to open transport session");
                let locked = matches!(e, TransportError::SessionLocked(_));
                self.schedule_restart(id, locked);
                return;
            }
        };

        let stores = WorkerStores::open(&self.state_dir, &config.id);
        let worker = match Worker::new(config.clone(), transport, stores) {
            Ok(worker) => worker,
            Err(e) => {
                // Only an invalid rule set lands here, and validation is
                // supposed to catch that upstream.
                error!(worker = %id, error = %e, "failed to construct worker");
                if let Some(slot) = self.slots.get_mut(id) {
                    slot.failed = true;
                }
                return;
            }
        };

        let (config_tx, config_rx) = watch::channel(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(worker.run(config_rx, shutdown_rx));

        if let Some(slot) = self.slots.get_mut(id) {
            slot.handle = Some(WorkerHandle {
                config_tx,
                shutdown_tx,
                join,
            });
            slot.backoff_until = None;
            info!(worker = %id, "worker started");
        }
    }

    /// Cooperatively stop a running worker: signal shutdown, wait out the
    /// grace period, abort if it will not finish.
    async fn stop_worker(&mut self, id: &str) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        let Some(handle) = slot.handle.take() else {
            return;
        };

        let _ = handle.shutdown_tx.send(true);
        let abort = handle.join.abort_handle();
        match tokio::time::timeout(SHUTDOWN_GRACE, handle.join).await {
            Ok(Ok(Ok(()))) => info!(worker = %id, "worker stopped"),
            Ok(Ok(Err(e))) => warn!(worker = %id, error = %e, "worker errored during shutdown"),
            Ok(Err(_)) => error!(worker = %id, "worker task panicked"),
            Err(_) => {
                error!(worker = %id, "worker did not stop in time, aborting");
                abort.abort();
            }
        }
        if let Some(slot) = self.slots.get_mut(id) {
            slot.backoff_until = None;
        }
    }

    /// Join a finished worker task and apply the restart policy.
    async fn reap_worker(&mut self, id: &str) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        let Some(handle) = slot.handle.take() else {
            return;
        };

        match handle.join.await {
            Ok(Ok(())) => {
                // A worker only returns cleanly when told to shut down; a
                // clean exit without a stop request still means the loop is
                // gone, so treat it like a crash and restart.
                warn!(worker = %id, "worker exited unexpectedly");
                self.schedule_restart(id, false);
            }
            Ok(Err(e)) => {
                error!(worker = %id, error = %e, "worker crashed");
                self.schedule_restart(id, e.is_session_lock());
            }
            Err(_) => {
                error!(worker = %id, "worker task panicked");
                self.schedule_restart(id, false);
            }
        }
    }

    /// Record a crash and either schedule a backoff restart or give up.
    fn schedule_restart(&mut self, id: &str, session_lock: bool) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        slot.restart_count += 1;

        if slot.restart_count > self.max_restarts {
            slot.failed = true;
            slot.backoff_until = None;
            error!(
                worker = %id,
                restarts = slot.restart_count,
                "worker failed too many times, giving up"
            );
            return;
        }

        let backoff_secs = 1u64
            .checked_shl(slot.restart_count)
            .map(|d| d.min(MAX_BACKOFF_SECS))
            .unwrap_or(MAX_BACKOFF_SECS);
        let delay_secs = if session_lock {
            // An immediate retry against a still-locked session loops
            // forever; give the lock time to clear.
            backoff_secs.max(LOCK_COOLDOWN_SECS)
        } else {
            backoff_secs
        };

        slot.backoff_until = Some(Instant::now() + Duration::from_secs(delay_secs));
        warn!(
            worker = %id,
            restarts = slot.restart_count,
            delay_secs,
            session_lock,
            "worker crash, backing off before restart"
        );
    }

    /// Stop every running worker: signal all first, then wait for each.
    async fn stop_all(&mut self) {
        for slot in self.slots.values() {
            if let Some(handle) = &slot.handle {
                let _ = handle.shutdown_tx.send(true);
            }
        }
        let ids: Vec<String> = self.slots.keys().cloned().collect();
        for id in ids {
            self.stop_worker(&id).await;
        }
    }
}
