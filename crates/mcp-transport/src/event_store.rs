use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use mcp_types::Message;

/// Monotonic event id minted by an [`EventStore`] for each message it
/// records, exposed to peers as the SSE `id:` field and accepted back as
/// `Last-Event-ID` on reconnect.
pub type EventId = u64;

/// One recorded SSE message, tagged with the stream it was emitted on so a
/// reconnect can be routed back to a live stream of the same identity.
#[derive(Clone, Debug)]
pub struct StoredEvent {
    pub id: EventId,
    pub stream_id: String,
    pub message: Message,
}

/// Pluggable append-only log keyed by event id, enabling Streamable-HTTP
/// clients to reconnect after a dropped stream without losing messages.
///
/// The transport treats every method here as atomic from its perspective
/// (spec §5); a real implementation backed by a database or file is free to
/// use whatever locking it needs internally.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Records `message` as the next event on `stream_id` and returns the
    /// id assigned to it.
    async fn store_event(&self, stream_id: &str, message: Message) -> EventId;

    /// Replays every event recorded after `last_event_id` on the stream it
    /// was originally emitted on, in order, via `sender`. Returns the id of
    /// that stream so the caller can resume live delivery on it.
    ///
    /// Returns `None` if `last_event_id` is unknown to this store (e.g. it
    /// has been pruned), in which case the caller has no stream to resume
    /// and must fall back to a fresh one.
    async fn replay_events_after(
        &self,
        last_event_id: EventId,
        sender: &(dyn Fn(StoredEvent) + Send + Sync),
    ) -> Option<String>;
}

/// In-memory reference [`EventStore`]. Keeps a bounded ring buffer per
/// stream so the crate is independently testable for resumability without
/// requiring a caller-supplied store.
pub struct InMemoryEventStore {
    next_id: AtomicU64,
    events: Mutex<VecDeque<StoredEvent>>,
    capacity: usize,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            events: Mutex::new(VecDeque::new()),
            capacity,
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(&self, stream_id: &str, message: Message) -> EventId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut events = self.events.lock().expect("event store lock poisoned");
        events.push_back(StoredEvent {
            id,
            stream_id: stream_id.to_string(),
            message,
        });
        while events.len() > self.capacity {
            events.pop_front();
        }
        id
    }

    async fn replay_events_after(
        &self,
        last_event_id: EventId,
        sender: &(dyn Fn(StoredEvent) + Send + Sync),
    ) -> Option<String> {
        let events = self.events.lock().expect("event store lock poisoned");
        if !events.iter().any(|e| e.id == last_event_id) && last_event_id != 0 {
            return None;
        }
        let mut resume_stream = None;
        for event in events.iter().filter(|e| e.id > last_event_id) {
            resume_stream = Some(event.stream_id.clone());
            sender(event.clone());
        }
        resume_stream.or_else(|| events.back().map(|e| e.stream_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_types::Message;
    use std::sync::Mutex as StdMutex;

    async fn collect_after(store: &InMemoryEventStore, after: EventId) -> Vec<EventId> {
        let collected = StdMutex::new(Vec::new());
        let stream_id = store
            .replay_events_after(after, &|event| collected.lock().unwrap().push(event.id))
            .await;
        assert!(stream_id.is_some());
        collected.into_inner().unwrap()
    }

    #[tokio::test]
    async fn replays_events_after_last_seen_in_order() {
        let store = InMemoryEventStore::new();
        for _ in 0..5 {
            store
                .store_event("_GET_stream", Message::notification("notifications/progress", None))
                .await;
        }
        // Events 1..=5 recorded; ask for everything after event 2.
        let collected = collect_after(&store, 2).await;
        assert_eq!(collected, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn unknown_last_event_id_returns_none() {
        let store = InMemoryEventStore::new();
        store
            .store_event("_GET_stream", Message::notification("notifications/progress", None))
            .await;
        let resumed = store.replay_events_after(9999, &|_| {}).await;
        assert!(resumed.is_none());
    }
}
