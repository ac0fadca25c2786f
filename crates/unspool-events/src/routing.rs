//! Event bus routing helpers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast::{self, Receiver, Sender, error::RecvError};
use unspool_core::{Notice, NotificationSink};

use crate::payloads::{DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId};

/// Shared event bus built on top of `tokio::broadcast`.
///
/// Publishing never waits for subscribers: when a subscriber falls behind by
/// more than the capacity, it skips the oldest envelopes and carries on.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    replay: Arc<Mutex<VecDeque<EventEnvelope>>>,
    replay_capacity: usize,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Construct a bus with a custom capacity; zero is treated as one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            replay: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            replay_capacity: capacity,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Construct a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish a new event, assigning it a sequential identifier.
    pub fn publish(&self, event: Event) -> EventId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };
        {
            let mut replay = self.lock_replay();
            if replay.len() == self.replay_capacity {
                let _ = replay.pop_front();
            }
            replay.push_back(envelope.clone());
        }
        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe to the bus, replaying buffered events newer than `since_id`.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let backlog = since_id.map_or_else(VecDeque::new, |since| {
            self.lock_replay()
                .iter()
                .filter(|envelope| envelope.id > since)
                .cloned()
                .collect()
        });
        EventStream {
            backlog,
            receiver: self.sender.subscribe(),
            dropped: 0,
        }
    }

    /// Last identifier in the replay buffer.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        self.lock_replay().back().map(|envelope| envelope.id)
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn lock_replay(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        self.replay.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSink for EventBus {
    fn notify(&self, notice: Notice) {
        let _ = self.publish(Event::ItemTransition(notice));
    }
}

/// Stream that yields the replay backlog first, then live events.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
    dropped: u64,
}

impl EventStream {
    /// Receive the next event; `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(envelope) = self.backlog.pop_front() {
            return Some(envelope);
        }
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(RecvError::Lagged(skipped)) => {
                    self.dropped = self.dropped.saturating_add(skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Envelopes skipped so far because this stream fell behind.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::time::timeout;
    use unspool_core::{ExternalIds, ItemStatus, SourceKind};

    fn started(n: usize) -> Event {
        Event::ExtractionStarted {
            name: format!("item-{n}"),
            queue_depth: n,
        }
    }

    #[tokio::test]
    async fn sequential_ids_and_replay() {
        let bus = EventBus::with_capacity(16);
        let mut last = 0;
        for n in 0..5 {
            last = bus.publish(started(n));
        }
        assert_eq!(last, 5);
        assert_eq!(bus.last_event_id(), Some(5));

        let mut stream = bus.subscribe(Some(2));
        let mut ids = Vec::new();
        for _ in 0..3 {
            if let Some(envelope) = stream.next().await {
                ids.push(envelope.id);
            }
        }
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_does_not_block() {
        let bus = EventBus::with_capacity(2);
        let result = timeout(Duration::from_secs(1), async {
            for n in 0..100 {
                let _ = bus.publish(started(n));
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_to_newest_events() {
        let bus = EventBus::with_capacity(4);
        let mut stream = bus.subscribe(None);
        for n in 0..10 {
            let _ = bus.publish(started(n));
        }
        assert_eq!(stream.dropped(), 0);
        let first = stream.next().await.map(|envelope| envelope.id);
        assert_eq!(first, Some(7));
        assert_eq!(stream.dropped(), 6);
        let second = stream.next().await.map(|envelope| envelope.id);
        assert_eq!(second, Some(8));
        assert_eq!(stream.dropped(), 6);
    }

    #[tokio::test]
    async fn sink_publishes_item_transitions() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe(None);
        bus.notify(Notice {
            name: "Album".into(),
            source: SourceKind::Lidarr,
            status: ItemStatus::Imported,
            path: PathBuf::from("/music/Album"),
            external_ids: ExternalIds::new(),
            outcome: None,
            at: Utc::now(),
        });
        let envelope = stream.next().await;
        assert_eq!(
            envelope.and_then(|envelope| envelope.event.status()),
            Some(ItemStatus::Imported)
        );
    }
}
