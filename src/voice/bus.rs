//! In-process publish/subscribe between the session and UI-facing state.
//!
//! Fan-out is synchronous: `publish` runs every matching handler on the
//! caller's turn, so handlers must not block.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::events::{ProtocolEvent, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&ProtocolEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    // Empty means every topic.
    topics: Vec<Topic>,
    handler: Handler,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the given topics; an empty slice subscribes to all.
    pub fn subscribe(
        &self,
        topics: &[Topic],
        handler: impl Fn(&ProtocolEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Subscriber {
            id,
            topics: topics.to_vec(),
            handler: Arc::new(handler),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Deliver `event` to every interested subscriber and return how many
    /// handlers ran. Events without a topic are not published.
    pub fn publish(&self, event: &ProtocolEvent) -> usize {
        let Some(topic) = event.topic() else {
            return 0;
        };

        // Snapshot so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<Handler> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.topics.is_empty() || s.topics.contains(&topic))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
