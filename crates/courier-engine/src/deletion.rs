//! Deletion synchronizer.
//!
//! Propagates source-feed deletions to targets using the persisted deletion
//! mapping. Outcomes per entry: synced or already-gone evict the mapping;
//! a permission failure retains it (a future grant can still act on it) and
//! is not retried automatically; an absent mapping is benign -- the message
//! predates tracking, was filtered out, or was pruned.

use tracing::{debug, error, info, warn};

use courier_transport::{Transport, TransportError};
use courier_types::RelaySettings;

use crate::store::DeletionMap;
use crate::worker::WorkerError;

/// Sync one batch of deleted source message ids.
pub(crate) async fn sync(
    worker_id: &str,
    transport: &dyn Transport,
    deletions: &mut DeletionMap,
    settings: &RelaySettings,
    source: i64,
    ids: &[i64],
) -> Result<(), WorkerError> {
    for &source_msg_id in ids {
        let Some(entry) = deletions.lookup(source, source_msg_id).cloned() else {
            debug!(
                worker = worker_id,
                source,
                message = source_msg_id,
                "deletion for unmapped message, skipping"
            );
            continue;
        };

        loop {
            match transport
                .delete_message(entry.target_id, entry.target_msg_id)
                .await
            {
                Ok(()) => {
                    deletions.remove(source, source_msg_id);
                    info!(
                        worker = worker_id,
                        source,
                        message = source_msg_id,
                        target = entry.target_id,
                        target_message = entry.target_msg_id,
                        "deletion synced"
                    );
                    break;
                }
                Err(TransportError::NotFound { .. }) => {
                    deletions.remove(source, source_msg_id);
                    debug!(
                        worker = worker_id,
                        target = entry.target_id,
                        target_message = entry.target_msg_id,
                        "target message already gone"
                    );
                    break;
                }
                Err(TransportError::PermissionDenied { feed }) => {
                    // Mapping retained so a later permission grant can act.
                    error!(
                        worker = worker_id,
                        target = feed,
                        target_message = entry.target_msg_id,
                        "no delete rights on target, keeping mapping"
                    );
                    break;
                }
                Err(TransportError::FloodWait { wait }) => {
                    let pause =
                        wait + std::time::Duration::from_secs(settings.flood_wait_extra_delay_secs);
                    warn!(
                        worker = worker_id,
                        pause_secs = pause.as_secs(),
                        "rate limited during deletion sync, pausing worker"
                    );
                    tokio::time::sleep(pause).await;
                }
                Err(TransportError::Auth(reason)) => return Err(WorkerError::Auth(reason)),
                Err(TransportError::SessionLocked(reason)) => {
                    return Err(WorkerError::SessionLocked(reason))
                }
                Err(e) => {
                    warn!(
                        worker = worker_id,
                        target = entry.target_id,
                        target_message = entry.target_msg_id,
                        error = %e,
                        "deletion failed, keeping mapping"
                    );
                    break;
                }
            }
        }
    }
    deletions.save()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use courier_transport::{MemoryTransport, MessagePayload, Outbound};
    use crate::store::DeletionEntry;

    async fn delivered_entry(transport: &MemoryTransport) -> i64 {
        transport
            .send_message(-2001, Outbound::Single(MessagePayload::Text { text: "x".into() }))
            .await
            .unwrap()
    }

    fn map_in(dir: &std::path::Path) -> DeletionMap {
        DeletionMap::load(dir.join("deletions.json"))
    }

    #[tokio::test]
    async fn synced_deletion_removes_target_and_mapping() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let target_msg = delivered_entry(&transport).await;

        let mut map = map_in(tmp.path());
        map.record(
            -1001,
            12345,
            DeletionEntry {
                target_id: -2001,
                target_msg_id: target_msg,
                timestamp: 1.0,
            },
        );

        sync(
            "w1",
            transport.as_ref(),
            &mut map,
            &RelaySettings::default(),
            -1001,
            &[12345],
        )
        .await
        .unwrap();

        assert!(transport.sent(-2001).is_empty());
        assert!(map.lookup(-1001, 12345).is_none());
    }

    #[tokio::test]
    async fn unmapped_deletion_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let mut map = map_in(tmp.path());

        sync(
            "w1",
            transport.as_ref(),
            &mut map,
            &RelaySettings::default(),
            -1001,
            &[99999],
        )
        .await
        .unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn already_gone_target_evicts_mapping() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let mut map = map_in(tmp.path());
        // Mapping points at a target message that was never delivered.
        map.record(
            -1001,
            7,
            DeletionEntry {
                target_id: -2001,
                target_msg_id: 424242,
                timestamp: 1.0,
            },
        );

        sync(
            "w1",
            transport.as_ref(),
            &mut map,
            &RelaySettings::default(),
            -1001,
            &[7],
        )
        .await
        .unwrap();
        assert!(map.lookup(-1001, 7).is_none());
    }

    #[tokio::test]
    async fn permission_failure_retains_mapping() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let target_msg = delivered_entry(&transport).await;

        let mut map = map_in(tmp.path());
        map.record(
            -1001,
            8,
            DeletionEntry {
                target_id: -2001,
                target_msg_id: target_msg,
                timestamp: 1.0,
            },
        );
        transport.fail_next_delete(TransportError::PermissionDenied { feed: -2001 });

        sync(
            "w1",
            transport.as_ref(),
            &mut map,
            &RelaySettings::default(),
            -1001,
            &[8],
        )
        .await
        .unwrap();

        // Kept for a future permission grant; target untouched.
        assert!(map.lookup(-1001, 8).is_some());
        assert_eq!(transport.sent(-2001).len(), 1);
    }

    #[tokio::test]
    async fn auth_failure_escalates() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let target_msg = delivered_entry(&transport).await;

        let mut map = map_in(tmp.path());
        map.record(
            -1001,
            9,
            DeletionEntry {
                target_id: -2001,
                target_msg_id: target_msg,
                timestamp: 1.0,
            },
        );
        transport.fail_next_delete(TransportError::Auth("revoked".into()));

        let err = sync(
            "w1",
            transport.as_ref(),
            &mut map,
            &RelaySettings::default(),
            -1001,
            &[9],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WorkerError::Auth(_)));
    }
}
