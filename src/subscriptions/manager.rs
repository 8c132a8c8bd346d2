//! Fan-out of store events to subscribers.

use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::types::{
    DropReason, StoreEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId,
};

struct Subscriber {
    filter: SubscriptionFilter,
    tx: Sender<StoreEvent>,
}

impl Subscriber {
    fn wants(&self, event: &StoreEvent) -> bool {
        if matches!(event, StoreEvent::WritesPut { .. }) && !self.filter.include_writes {
            return false;
        }

        // Store-wide events carry no thread and reach every subscriber.
        match &self.filter.thread_ids {
            None => true,
            Some(wanted) => {
                let threads = event.thread_ids();
                threads.is_empty() || threads.iter().any(|t| wanted.iter().any(|w| w == t))
            }
        }
    }

    /// Tell the receiver it has been cut off. Ignored if its buffer is full.
    fn notify_dropped(&self, reason: DropReason) {
        let _ = self.tx.try_send(StoreEvent::Dropped { reason });
    }
}

/// Registry of live subscribers.
///
/// Delivery never blocks: a subscriber whose buffer is full, or whose handle
/// was dropped, is removed on the next broadcast that reaches it.
pub struct SubscriptionManager {
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    ids: AtomicU64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            ids: AtomicU64::new(1),
        }
    }

    /// Register a subscriber and hand back its receiving end.
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        let id = SubscriptionId(self.ids.fetch_add(1, Ordering::Relaxed));
        let (tx, receiver) = bounded(config.buffer_size.max(1));

        self.subscribers.write().insert(
            id,
            Subscriber {
                filter: config.filter,
                tx,
            },
        );
        debug!(target: "checkpoint::events", subscription = id.0, "Subscribed");

        SubscriptionHandle { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(subscriber) = self.subscribers.write().remove(&id) {
            subscriber.notify_dropped(DropReason::Unsubscribed);
        }
    }

    /// Number of live subscribers.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver an event to every subscriber whose filter accepts it.
    pub fn broadcast(&self, event: StoreEvent) {
        let stalled: Vec<SubscriptionId> = {
            let subscribers = self.subscribers.read();
            subscribers
                .iter()
                .filter(|(_, s)| s.wants(&event))
                .filter(|(_, s)| s.tx.try_send(event.clone()).is_err())
                .map(|(id, _)| *id)
                .collect()
        };

        if stalled.is_empty() {
            return;
        }

        let mut subscribers = self.subscribers.write();
        for id in stalled {
            if let Some(subscriber) = subscribers.remove(&id) {
                debug!(target: "checkpoint::events", subscription = id.0, "Dropping stalled subscriber");
                subscriber.notify_dropped(DropReason::BufferOverflow);
            }
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}
