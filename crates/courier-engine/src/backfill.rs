//! Backfill orchestrator.
//!
//! Populates a target feed with a source's existing history exactly once
//! per pair. The caller (the worker) invokes this only when the pair has no
//! completion marker, and writes the marker itself once `run` reports
//! [`BackfillOutcome::Completed`] -- so a crash mid-run leaves no marker
//! and the next start re-walks. Duplicate avoidance across that re-walk
//! relies on checkpoint advancement, which keeps the whole path
//! at-least-once rather than exactly-once.

use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use courier_transport::ListQuery;
use courier_types::ChannelPair;

use crate::forward::{group_messages, Forwarder, RelayOutcome};
use crate::store::{CheckpointStore, DeletionMap};
use crate::worker::WorkerError;

/// How a backfill run ended (short of a fatal worker error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackfillOutcome {
    /// All requested history was processed; write the marker.
    Completed,
    /// The target refused writes; park the pair, write no marker.
    PermissionSkipped,
    /// The source forbids copying; park the pair, write no marker.
    Restricted,
}

/// Run the backfill for one pair.
///
/// `backfill_count` semantics: negative skips history entirely (the marker
/// is still written so the pair goes straight to live), positive replays
/// the most recent N messages oldest-first, and zero performs a full copy
/// paged from the oldest message forward.
pub(crate) async fn run(
    forwarder: &Forwarder<'_>,
    checkpoints: &mut CheckpointStore,
    deletions: &mut DeletionMap,
    pair: &ChannelPair,
) -> Result<BackfillOutcome, WorkerError> {
    if pair.backfill_count < 0 {
        info!(
            worker = forwarder.worker_id,
            source = pair.source,
            target = pair.target,
            "backfill disabled for pair, marking complete"
        );
        return Ok(BackfillOutcome::Completed);
    }

    if pair.backfill_count > 0 {
        let mut messages = forwarder
            .list_with_retry(
                pair.source,
                ListQuery::newest(pair.backfill_count as usize),
            )
            .await?;
        // Newest-first page, replayed oldest-first.
        messages.reverse();
        return relay_batch(forwarder, checkpoints, deletions, pair, messages).await;
    }

    // Full copy: page the entire history from the oldest message forward.
    let batch_size = forwarder.settings.backfill_batch_size.max(1);
    let mut cursor = 0i64;
    let mut total = 0usize;
    loop {
        let batch = forwarder
            .list_with_retry(pair.source, ListQuery::after(cursor, batch_size))
            .await?;
        if batch.is_empty() {
            break;
        }
        cursor = batch.last().map(|m| m.id).unwrap_or(cursor);
        total += batch.len();

        let outcome = relay_batch(forwarder, checkpoints, deletions, pair, batch).await?;
        if outcome != BackfillOutcome::Completed {
            return Ok(outcome);
        }

        debug!(
            worker = forwarder.worker_id,
            source = pair.source,
            processed = total,
            "backfill batch done"
        );
        sleep(Duration::from_millis(
            forwarder.settings.backfill_batch_delay_ms,
        ))
        .await;
    }

    info!(
        worker = forwarder.worker_id,
        source = pair.source,
        target = pair.target,
        total,
        "full history copy finished"
    );
    Ok(BackfillOutcome::Completed)
}

/// Replay one ascending batch through filter -> transform -> delivery,
/// advancing the checkpoint as each logical unit resolves.
async fn relay_batch(
    forwarder: &Forwarder<'_>,
    checkpoints: &mut CheckpointStore,
    deletions: &mut DeletionMap,
    pair: &ChannelPair,
    batch: Vec<courier_transport::Message>,
) -> Result<BackfillOutcome, WorkerError> {
    for group in group_messages(batch) {
        let Some(last_id) = group.last().map(|m| m.id) else {
            continue;
        };

        let outcome = forwarder
            .relay_group(pair.source, pair.target, &group, deletions)
            .await?;
        match outcome {
            RelayOutcome::Delivered { .. }
            | RelayOutcome::Filtered
            | RelayOutcome::Dropped => {
                checkpoints.advance(pair.source, last_id);
            }
            RelayOutcome::PermissionSkipped => return Ok(BackfillOutcome::PermissionSkipped),
            RelayOutcome::Restricted => return Ok(BackfillOutcome::Restricted),
        }
    }
    checkpoints.save()?;
    deletions.save()?;
    Ok(BackfillOutcome::Completed)
}
