use crate::domain::events::{EventListener, RefinementEvent};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;

/// Event bus for publishing refinement events to multiple listeners.
///
/// The transport that carries events to remote observers subscribes a
/// listener here; the loop itself only ever writes to the bus.
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Arc<dyn EventListener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Subscribe a listener to events
    pub async fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Publish an event to all listeners
    pub async fn publish(&self, event: RefinementEvent) {
        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener.on_event(&event);
        }
    }

    /// Get count of subscribers (for testing)
    pub async fn subscriber_count(&self) -> usize {
        self.listeners.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
        }
    }
}

/// Forwards events into an unbounded channel. Lets transports (and tests)
/// consume events asynchronously without blocking the loop.
pub struct ChannelListener {
    tx: UnboundedSender<RefinementEvent>,
}

impl ChannelListener {
    pub fn new(tx: UnboundedSender<RefinementEvent>) -> Self {
        Self { tx }
    }
}

impl EventListener for ChannelListener {
    fn on_event(&self, event: &RefinementEvent) {
        // A closed receiver just means the observer went away.
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::LoggingListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        count: Arc<AtomicUsize>,
    }

    impl EventListener for CountingListener {
        fn on_event(&self, _event: &RefinementEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_event_bus_subscribe() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count().await, 0);

        bus.subscribe(Arc::new(LoggingListener)).await;
        assert_eq!(bus.subscriber_count().await, 1);

        bus.subscribe(Arc::new(LoggingListener)).await;
        assert_eq!(bus.subscriber_count().await, 2);
    }

    #[tokio::test]
    async fn test_event_bus_publish() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(Arc::new(CountingListener {
            count: Arc::clone(&count),
        }))
        .await;

        bus.publish(RefinementEvent::Cooldown { seconds: 60 }).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_event_bus_multiple_listeners() {
        let bus = EventBus::new();

        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        bus.subscribe(Arc::new(CountingListener {
            count: Arc::clone(&count1),
        }))
        .await;
        bus.subscribe(Arc::new(CountingListener {
            count: Arc::clone(&count2),
        }))
        .await;

        bus.publish(RefinementEvent::LoopStopped).await;

        assert_eq!(count1.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_event_bus_clone() {
        let bus1 = EventBus::new();
        let bus2 = bus1.clone();

        bus1.subscribe(Arc::new(LoggingListener)).await;

        // Clone should share the same listeners
        assert_eq!(bus2.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_channel_listener_forwards() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(Arc::new(ChannelListener::new(tx))).await;

        bus.publish(RefinementEvent::LoopStarted {
            strategy_id: "s-1".to_string(),
        })
        .await;

        let received = rx.recv().await.unwrap();
        assert_eq!(
            received,
            RefinementEvent::LoopStarted {
                strategy_id: "s-1".to_string()
            }
        );
    }
}
