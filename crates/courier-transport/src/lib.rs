//! Transport capability boundary for the courier relay.
//!
//! The relay engine never speaks the remote service's wire protocol. It
//! consumes a session through the [`Transport`] trait: list historical
//! messages, send, delete, and subscribe to live feed events. A concrete
//! client (the external collaborator that owns authentication and the wire
//! format) implements [`Transport`] plus a [`Connector`] that opens one
//! exclusive session per credentials reference.
//!
//! [`MemoryTransport`] is the in-process implementation used by the
//! workspace's tests and the CLI's loopback mode.

pub mod memory;
pub mod message;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::{MemoryConnector, MemoryTransport};
pub use message::{FeedEvent, Message, MessagePayload, Outbound};

/// Errors from transport operations.
///
/// The engine's entire failure taxonomy hangs off these variants: which are
/// retried, which pause the worker, which skip a pair, and which kill the
/// session.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The server mandated a pause before any further call.
    #[error("rate limited, server mandated a {}s wait", wait.as_secs())]
    FloodWait { wait: Duration },

    /// Credentials rejected or session invalidated. Fatal to the worker.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Session storage is held by another process. Fatal to the worker;
    /// the supervisor applies a longer restart cooldown for this signature.
    #[error("session storage is locked: {0}")]
    SessionLocked(String),

    /// No write/delete rights on the feed. The operation is skipped.
    #[error("no permission on feed {feed}")]
    PermissionDenied { feed: i64 },

    /// The source feed forbids copying content out. Fatal to the pair.
    #[error("feed {feed} restricts copying content")]
    ForwardsRestricted { feed: i64 },

    /// The referenced message no longer exists. Benign.
    #[error("message {message_id} not found in feed {feed}")]
    NotFound { feed: i64, message_id: i64 },

    /// Connectivity or timeout failure. Retried with backoff.
    #[error("network error: {0}")]
    Network(String),

    /// The service rejected the request for any other reason.
    #[error("API error: {0}")]
    Api(String),
}

impl TransportError {
    /// Whether the error is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Api(_))
    }
}

/// Message listing window.
///
/// `after_id` is an exclusive lower bound; results are ascending by id
/// unless `newest_first` is set (used to find the live tail of a feed).
#[derive(Debug, Clone, Copy, Default)]
pub struct ListQuery {
    pub after_id: Option<i64>,
    pub limit: usize,
    pub newest_first: bool,
}

impl ListQuery {
    /// Ascending page of up to `limit` messages with id greater than `after`.
    pub fn after(after: i64, limit: usize) -> Self {
        Self {
            after_id: Some(after),
            limit,
            newest_first: false,
        }
    }

    /// The newest `limit` messages, newest first.
    pub fn newest(limit: usize) -> Self {
        Self {
            after_id: None,
            limit,
            newest_first: true,
        }
    }
}

/// One authenticated session against the remote messaging service.
///
/// Implementations must serialize nothing themselves: the engine issues one
/// call at a time per worker, which is how per-account rate budgets are
/// respected.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// List messages in a feed according to `query`.
    async fn list_messages(
        &self,
        feed: i64,
        query: ListQuery,
    ) -> Result<Vec<Message>, TransportError>;

    /// Deliver a message (or album) to a feed, returning the new message id
    /// (the first id for an album).
    async fn send_message(&self, feed: i64, outbound: Outbound) -> Result<i64, TransportError>;

    /// Delete a previously delivered message from a feed.
    async fn delete_message(&self, feed: i64, message_id: i64) -> Result<(), TransportError>;

    /// Subscribe to live events (new messages, deletions) for all feeds
    /// visible to this session. The receiver closing means the push stream
    /// is gone and the caller should rely on polling.
    async fn subscribe_events(&self) -> Result<mpsc::Receiver<FeedEvent>, TransportError>;
}

/// Opens transport sessions for workers.
///
/// One connector serves the whole supervisor; each `connect` call must
/// yield a session exclusively owned by the calling worker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, session: &str) -> Result<Arc<dyn Transport>, TransportError>;
}
