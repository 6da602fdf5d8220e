//! Shared delivery machinery.
//!
//! [`Forwarder`] is the filter -> transform -> deliver path used by both the
//! live forwarding loop and the backfill orchestrator. It owns the per-call
//! reliability policy: exponential backoff for transient errors, a full
//! worker pause for rate limits, and classification of the permission and
//! restriction outcomes the caller turns into pair state.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use courier_transport::{
    ListQuery, Message, MessagePayload, Outbound, Transport, TransportError,
};
use courier_types::RelaySettings;

use crate::filter::FilterPipeline;
use crate::store::{DeletionEntry, DeletionMap};
use crate::transform::TransformPipeline;
use crate::worker::WorkerError;

/// Delivery backoff never sleeps longer than this, regardless of attempt.
const MAX_RETRY_DELAY_SECS: u64 = 300;

/// What happened to one logical unit of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayOutcome {
    /// Delivered; the checkpoint may advance and the mapping was recorded.
    Delivered { target_msg_id: i64 },
    /// Rejected by the filter; the checkpoint advances without delivery.
    Filtered,
    /// Benignly undeliverable (e.g. gone); the checkpoint advances.
    Dropped,
    /// No write access on the target. The pair is skipped, checkpoint held.
    PermissionSkipped,
    /// The source forbids copying. Fatal to the pair.
    Restricted,
}

pub(crate) struct Forwarder<'a> {
    pub worker_id: &'a str,
    pub transport: &'a dyn Transport,
    pub filter: &'a FilterPipeline,
    pub transform: &'a TransformPipeline,
    pub settings: &'a RelaySettings,
}

impl Forwarder<'_> {
    /// Relay one logical unit (a single message or a whole album) from
    /// `source` to `target`, recording the deletion mapping on success.
    pub async fn relay_group(
        &self,
        source: i64,
        target: i64,
        group: &[Message],
        deletions: &mut DeletionMap,
    ) -> Result<RelayOutcome, WorkerError> {
        let Some(first) = group.first() else {
            return Ok(RelayOutcome::Dropped);
        };

        // Albums carry their caption on whichever member has text.
        let text = group.iter().find_map(|m| m.text_content());
        if !self.filter.should_relay(text) {
            debug!(
                worker = self.worker_id,
                source,
                message = first.id,
                "message filtered out"
            );
            return Ok(RelayOutcome::Filtered);
        }

        let mut payloads: Vec<MessagePayload> = group
            .iter()
            .map(|m| self.transform_payload(m.payload.clone()))
            .collect();
        let outbound = if payloads.len() == 1 {
            Outbound::Single(payloads.remove(0))
        } else {
            Outbound::Album(payloads)
        };

        let outcome = self.deliver_with_retry(target, outbound).await?;

        if let RelayOutcome::Delivered { target_msg_id } = outcome {
            let timestamp = now_ts();
            for message in group {
                deletions.record(
                    source,
                    message.id,
                    DeletionEntry {
                        target_id: target,
                        target_msg_id,
                        timestamp,
                    },
                );
            }
            info!(
                worker = self.worker_id,
                source,
                target,
                message = first.id,
                items = group.len(),
                "message relayed"
            );
        }
        Ok(outcome)
    }

    /// Apply the transform pipeline to a payload's text/caption only.
    fn transform_payload(&self, payload: MessagePayload) -> MessagePayload {
        if self.transform.is_empty() {
            return payload;
        }
        match payload.text() {
            Some(text) => {
                let transformed = self.transform.apply(text);
                payload.with_text(transformed)
            }
            None => payload,
        }
    }

    /// One delivery with the full reliability policy applied.
    async fn deliver_with_retry(
        &self,
        target: i64,
        outbound: Outbound,
    ) -> Result<RelayOutcome, WorkerError> {
        let mut attempt: u32 = 0;
        loop {
            match self.transport.send_message(target, outbound.clone()).await {
                Ok(target_msg_id) => return Ok(RelayOutcome::Delivered { target_msg_id }),
                Err(TransportError::FloodWait { wait }) => {
                    // Rate limit pauses the whole worker; not a retry attempt.
                    self.pause_for_flood(wait).await;
                }
                Err(TransportError::PermissionDenied { feed }) => {
                    warn!(
                        worker = self.worker_id,
                        target = feed,
                        "no write access on target, skipping pair until operator intervenes"
                    );
                    return Ok(RelayOutcome::PermissionSkipped);
                }
                Err(TransportError::ForwardsRestricted { feed }) => {
                    warn!(
                        worker = self.worker_id,
                        feed,
                        "content copying restricted, disabling pair"
                    );
                    return Ok(RelayOutcome::Restricted);
                }
                Err(TransportError::NotFound { feed, message_id }) => {
                    debug!(
                        worker = self.worker_id,
                        target = feed,
                        message = message_id,
                        "message gone before delivery, skipping"
                    );
                    return Ok(RelayOutcome::Dropped);
                }
                Err(TransportError::Auth(reason)) => return Err(WorkerError::Auth(reason)),
                Err(TransportError::SessionLocked(reason)) => {
                    return Err(WorkerError::SessionLocked(reason))
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.settings.retry_attempts {
                        return Err(WorkerError::RetriesExhausted {
                            target,
                            attempts: attempt,
                            last: err,
                        });
                    }
                    let delay = retry_delay(self.settings.retry_delay_secs, attempt);
                    warn!(
                        worker = self.worker_id,
                        target,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "delivery failed, backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// List messages with the same retry policy as delivery.
    pub async fn list_with_retry(
        &self,
        feed: i64,
        query: ListQuery,
    ) -> Result<Vec<Message>, WorkerError> {
        let mut attempt: u32 = 0;
        loop {
            match self.transport.list_messages(feed, query).await {
                Ok(messages) => return Ok(messages),
                Err(TransportError::FloodWait { wait }) => self.pause_for_flood(wait).await,
                Err(TransportError::Auth(reason)) => return Err(WorkerError::Auth(reason)),
                Err(TransportError::SessionLocked(reason)) => {
                    return Err(WorkerError::SessionLocked(reason))
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.settings.retry_attempts {
                        return Err(WorkerError::RetriesExhausted {
                            target: feed,
                            attempts: attempt,
                            last: err,
                        });
                    }
                    let delay = retry_delay(self.settings.retry_delay_secs, attempt);
                    warn!(
                        worker = self.worker_id,
                        feed,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "listing failed, backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Pause the whole worker for the server-mandated wait plus the
    /// configured buffer.
    pub async fn pause_for_flood(&self, wait: Duration) {
        let pause = wait + Duration::from_secs(self.settings.flood_wait_extra_delay_secs);
        warn!(
            worker = self.worker_id,
            wait_secs = wait.as_secs(),
            pause_secs = pause.as_secs(),
            "rate limited, pausing worker"
        );
        sleep(pause).await;
    }
}

/// Exponential backoff for attempt `n` (1-based), capped.
fn retry_delay(base_secs: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
    let secs = base_secs
        .saturating_mul(factor)
        .min(MAX_RETRY_DELAY_SECS);
    Duration::from_secs(secs)
}

/// Unix timestamp with fractional seconds.
pub(crate) fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Split an ascending batch into logical units: runs of messages sharing a
/// `grouped_id` become one album, everything else stands alone.
pub(crate) fn group_messages(batch: Vec<Message>) -> Vec<Vec<Message>> {
    let mut groups: Vec<Vec<Message>> = Vec::new();
    for message in batch {
        match (message.grouped_id, groups.last_mut()) {
            (Some(gid), Some(last))
                if last.first().and_then(|m| m.grouped_id) == Some(gid) =>
            {
                last.push(message);
            }
            _ => groups.push(vec![message]),
        }
    }
    groups
}
