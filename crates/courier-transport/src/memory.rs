//! In-memory transport implementation.
//!
//! Backs the workspace's tests and the CLI's loopback mode. Feeds are plain
//! vectors of messages; deliveries are recorded per target feed; faults can
//! be scripted per call or pinned per feed to exercise every branch of the
//! engine's error taxonomy.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::message::{FeedEvent, Message, Outbound};
use crate::{Connector, ListQuery, Transport, TransportError};

#[derive(Default)]
struct Inner {
    /// Seeded source feeds, messages kept sorted by id.
    feeds: HashMap<i64, Vec<Message>>,
    /// Deliveries recorded per target feed as (assigned id, outbound).
    outbox: HashMap<i64, Vec<(i64, Outbound)>>,
    /// Next id assigned per target feed.
    next_ids: HashMap<i64, i64>,
    /// One-shot faults consumed by the next send calls, in order.
    send_faults: VecDeque<TransportError>,
    /// Persistent fault returned for every send to a feed.
    feed_send_faults: HashMap<i64, TransportError>,
    /// One-shot faults consumed by the next delete calls.
    delete_faults: VecDeque<TransportError>,
    /// One-shot faults consumed by the next list calls.
    list_faults: VecDeque<TransportError>,
    send_calls: u64,
    event_tx: Option<mpsc::Sender<FeedEvent>>,
}

/// In-memory [`Transport`] test double.
pub struct MemoryTransport {
    inner: Mutex<Inner>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Replace the contents of a source feed.
    pub fn seed(&self, feed: i64, mut messages: Vec<Message>) {
        messages.sort_by_key(|m| m.id);
        self.inner.lock().unwrap().feeds.insert(feed, messages);
    }

    /// Append one message to a source feed and emit a `NewMessage` event if
    /// a subscriber is attached.
    pub fn append(&self, feed: i64, message: Message) {
        let tx = {
            let mut inner = self.inner.lock().unwrap();
            let id = message.id;
            let feed_messages = inner.feeds.entry(feed).or_default();
            feed_messages.push(message);
            feed_messages.sort_by_key(|m| m.id);
            inner.event_tx.clone().map(|tx| (tx, id))
        };
        if let Some((tx, id)) = tx {
            let _ = tx.try_send(FeedEvent::NewMessage {
                feed,
                message_id: id,
            });
        }
    }

    /// Emit an arbitrary event to the subscriber, if any.
    pub fn emit(&self, event: FeedEvent) {
        let tx = self.inner.lock().unwrap().event_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.try_send(event);
        }
    }

    /// Queue a fault for the next send call.
    pub fn fail_next_send(&self, err: TransportError) {
        self.inner.lock().unwrap().send_faults.push_back(err);
    }

    /// Pin a persistent fault on every send to `feed`.
    pub fn fail_sends_to(&self, feed: i64, err: TransportError) {
        self.inner.lock().unwrap().feed_send_faults.insert(feed, err);
    }

    /// Clear a persistent per-feed send fault.
    pub fn clear_send_fault(&self, feed: i64) {
        self.inner.lock().unwrap().feed_send_faults.remove(&feed);
    }

    /// Queue a fault for the next delete call.
    pub fn fail_next_delete(&self, err: TransportError) {
        self.inner.lock().unwrap().delete_faults.push_back(err);
    }

    /// Queue a fault for the next list call.
    pub fn fail_next_list(&self, err: TransportError) {
        self.inner.lock().unwrap().list_faults.push_back(err);
    }

    /// Deliveries recorded for a target feed, in send order.
    pub fn sent(&self, feed: i64) -> Vec<(i64, Outbound)> {
        self.inner
            .lock()
            .unwrap()
            .outbox
            .get(&feed)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of send calls observed (including failed ones).
    pub fn send_calls(&self) -> u64 {
        self.inner.lock().unwrap().send_calls
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn list_messages(
        &self,
        feed: i64,
        query: ListQuery,
    ) -> Result<Vec<Message>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.list_faults.pop_front() {
            return Err(err);
        }

        let mut messages: Vec<Message> = inner
            .feeds
            .get(&feed)
            .map(|m| m.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(|m| query.after_id.map_or(true, |after| m.id > after))
            .cloned()
            .collect();

        if query.newest_first {
            messages.reverse();
        }
        if query.limit > 0 {
            messages.truncate(query.limit);
        }
        Ok(messages)
    }

    async fn send_message(&self, feed: i64, outbound: Outbound) -> Result<i64, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.send_calls += 1;
        if let Some(err) = inner.send_faults.pop_front() {
            return Err(err);
        }
        if let Some(err) = inner.feed_send_faults.get(&feed) {
            return Err(err.clone());
        }

        let next = inner.next_ids.entry(feed).or_insert(1000);
        let id = *next;
        *next += outbound.len() as i64;
        inner.outbox.entry(feed).or_default().push((id, outbound));
        Ok(id)
    }

    async fn delete_message(&self, feed: i64, message_id: i64) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.delete_faults.pop_front() {
            return Err(err);
        }

        let outbox = inner.outbox.entry(feed).or_default();
        let before = outbox.len();
        outbox.retain(|(id, _)| *id != message_id);
        if outbox.len() == before {
            return Err(TransportError::NotFound { feed, message_id });
        }
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<mpsc::Receiver<FeedEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(64);
        self.inner.lock().unwrap().event_tx = Some(tx);
        Ok(rx)
    }
}

/// [`Connector`] over a fixed set of in-memory sessions.
///
/// Unknown session names get a fresh empty transport, which is what the
/// CLI's loopback mode wants; tests insert pre-seeded transports or pin a
/// connect fault to exercise the supervisor's failure paths.
#[derive(Default)]
pub struct MemoryConnector {
    sessions: Mutex<HashMap<String, Arc<MemoryTransport>>>,
    faults: Mutex<HashMap<String, TransportError>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport for a session name.
    pub fn insert(&self, session: &str, transport: Arc<MemoryTransport>) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.to_string(), transport);
    }

    /// Make every connect for `session` fail with `err`.
    pub fn fail_session(&self, session: &str, err: TransportError) {
        self.faults
            .lock()
            .unwrap()
            .insert(session.to_string(), err);
    }

    /// Stop failing connects for `session`.
    pub fn clear_fault(&self, session: &str) {
        self.faults.lock().unwrap().remove(session);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, session: &str) -> Result<Arc<dyn Transport>, TransportError> {
        if let Some(err) = self.faults.lock().unwrap().get(session) {
            return Err(err.clone());
        }
        let transport = self
            .sessions
            .lock()
            .unwrap()
            .entry(session.to_string())
            .or_insert_with(|| Arc::new(MemoryTransport::new()))
            .clone();
        Ok(transport)
    }
}
