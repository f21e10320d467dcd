//! Subscriber registry for connection events.
//!
//! Every subscriber owns an unbounded queue, so publishing never blocks and
//! never drops: each subscriber sees every event, in publish order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tracing::trace;

use crate::types::ConnectionEvent;

type Registry = Mutex<HashMap<u64, mpsc::UnboundedSender<ConnectionEvent>>>;

/// Fan-out of [`ConnectionEvent`]s to all live subscriptions.
#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: Arc<Registry>,
    next_id: AtomicU64,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber. It receives events published after this call.
    pub(crate) fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.insert(id, tx);
        }
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// Delivers an event to every subscriber.
    pub(crate) fn publish(&self, event: ConnectionEvent) {
        let Ok(mut subs) = self.subscribers.lock() else {
            return;
        };
        // Receivers dropped without unsubscribing are pruned here.
        subs.retain(|id, tx| {
            let alive = tx.send(event.clone()).is_ok();
            if !alive {
                trace!(subscriber = id, "pruning closed subscriber");
            }
            alive
        });
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Handle to a registration on the connection manager's event stream.
///
/// Dropping the handle cancels the subscription.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Waits for the next event. Returns `None` once the subscription is
    /// cancelled or the manager is gone and all queued events are drained.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }

    /// Returns the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.try_recv().ok()
    }

    /// Cancels the subscription.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade()
            && let Ok(mut subs) = registry.lock()
        {
            subs.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectionState;

    fn state(s: ConnectionState) -> ConnectionEvent {
        ConnectionEvent::StateChanged(s)
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_in_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(state(ConnectionState::Connecting));
        bus.publish(state(ConnectionState::Connected));

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.recv().await, Some(state(ConnectionState::Connecting)));
            assert_eq!(sub.recv().await, Some(state(ConnectionState::Connected)));
            assert!(sub.try_recv().is_none());
        }
    }

    #[test]
    fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.publish(state(ConnectionState::Connecting));
        let mut sub = bus.subscribe();
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn unsubscribe_removes_registration() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let _b = bus.subscribe();
        a.unsubscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn dropping_subscription_removes_registration() {
        let bus = EventBus::new();
        {
            let _sub = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
        // Publishing with no subscribers is fine.
        bus.publish(state(ConnectionState::Failed));
    }

    #[tokio::test]
    async fn recv_ends_when_bus_is_dropped() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(state(ConnectionState::Connecting));
        drop(bus);
        assert_eq!(sub.recv().await, Some(state(ConnectionState::Connecting)));
        assert_eq!(sub.recv().await, None);
    }
}
