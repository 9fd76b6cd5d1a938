//! Subscriber Registry
//!
//! The broadcast sink behind the batch stage: an explicit registry of
//! connected subscribers (`register` / `unregister` / `deliver`) where the
//! transport adapter, not the pipeline, owns connection health.
//!
//! # Delivery
//!
//! Each subscriber gets a bounded outbound queue. `deliver` enqueues the
//! batch on every queue without ever awaiting: a subscriber whose queue is
//! full (too slow to drain) or closed (connection gone) is pruned on the
//! spot, isolating it from the rest. Per-subscriber message order follows
//! window order because each queue is FIFO.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::application::ports::{BatchSink, SinkError};

/// Unique identifier for a registered subscriber.
pub type SubscriberId = Uuid;

/// A registered subscriber's outbound queue.
struct Subscriber {
    tx: mpsc::Sender<Arc<str>>,
}

/// Registry of all currently-connected batch subscribers.
///
/// The registry lock is independent of the cache lock; no cross-stage
/// lock ordering exists.
pub struct SubscriberRegistry {
    queue_capacity: usize,
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
}

impl SubscriberRegistry {
    /// Create an empty registry; each subscriber gets an outbound queue of
    /// `queue_capacity` batches.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new subscriber and hand back its batch receiver.
    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = Uuid::new_v4();

        let mut subscribers = self.subscribers.write();
        subscribers.insert(id, Subscriber { tx });
        let connected = subscribers.len();
        drop(subscribers);

        gauge!("bondstream_subscribers_connected").set(connected as f64);
        tracing::info!(subscriber_id = %id, connected, "Subscriber registered");
        (id, rx)
    }

    /// Remove a subscriber. Returns whether it was still registered.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        let removed = subscribers.remove(&id).is_some();
        let connected = subscribers.len();
        drop(subscribers);

        if removed {
            gauge!("bondstream_subscribers_connected").set(connected as f64);
            tracing::info!(subscriber_id = %id, connected, "Subscriber unregistered");
        }
        removed
    }

    /// Number of currently-registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Enqueue the batch for every subscriber, pruning the ones that
    /// cannot take it. Returns how many accepted it.
    fn fan_out(&self, batch: &Arc<str>) -> usize {
        let mut subscribers = self.subscribers.write();

        subscribers.retain(|id, subscriber| {
            match subscriber.tx.try_send(Arc::clone(batch)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    counter!("bondstream_subscribers_pruned_total", "reason" => "slow")
                        .increment(1);
                    tracing::warn!(subscriber_id = %id, "Subscriber too slow; pruning");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    counter!("bondstream_subscribers_pruned_total", "reason" => "closed")
                        .increment(1);
                    tracing::debug!(subscriber_id = %id, "Subscriber gone; pruning");
                    false
                }
            }
        });

        let connected = subscribers.len();
        drop(subscribers);

        gauge!("bondstream_subscribers_connected").set(connected as f64);
        connected
    }
}

#[async_trait]
impl BatchSink for SubscriberRegistry {
    async fn deliver(&self, batch: Arc<str>) -> Result<usize, SinkError> {
        Ok(self.fan_out(&batch))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deliver_reaches_all_subscribers() {
        let registry = SubscriberRegistry::new(8);
        let (_id1, mut rx1) = registry.register();
        let (_id2, mut rx2) = registry.register();

        let delivered = registry.deliver("batch-1\n".into()).await.unwrap();
        assert_eq!(delivered, 2);

        assert_eq!(&*rx1.recv().await.unwrap(), "batch-1\n");
        assert_eq!(&*rx2.recv().await.unwrap(), "batch-1\n");
    }

    #[tokio::test]
    async fn per_subscriber_order_is_preserved() {
        let registry = SubscriberRegistry::new(8);
        let (_id, mut rx) = registry.register();

        for batch in ["b1\n", "b2\n", "b3\n"] {
            registry.deliver(batch.into()).await.unwrap();
        }

        assert_eq!(&*rx.recv().await.unwrap(), "b1\n");
        assert_eq!(&*rx.recv().await.unwrap(), "b2\n");
        assert_eq!(&*rx.recv().await.unwrap(), "b3\n");
    }

    #[tokio::test]
    async fn slow_subscriber_is_pruned_without_affecting_others() {
        let registry = SubscriberRegistry::new(1);
        let (slow_id, _slow_rx) = registry.register(); // never drained
        let (_fast_id, mut fast_rx) = registry.register();

        let delivered = registry.deliver("b1\n".into()).await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(&*fast_rx.recv().await.unwrap(), "b1\n");

        // Slow queue is still full: pruned on the next delivery.
        let delivered = registry.deliver("b2\n".into()).await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(registry.subscriber_count(), 1);
        assert!(!registry.unregister(slow_id));

        assert_eq!(&*fast_rx.recv().await.unwrap(), "b2\n");
    }

    #[tokio::test]
    async fn disconnected_subscriber_is_pruned() {
        let registry = SubscriberRegistry::new(8);
        let (_id, rx) = registry.register();
        drop(rx);

        let delivered = registry.deliver("b1\n".into()).await.unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unregister_removes_subscriber() {
        let registry = SubscriberRegistry::new(8);
        let (id, _rx) = registry.register();
        assert_eq!(registry.subscriber_count(), 1);

        assert!(registry.unregister(id));
        assert_eq!(registry.subscriber_count(), 0);
        assert!(!registry.unregister(id));
    }

    #[tokio::test]
    async fn deliver_with_no_subscribers_is_a_no_op() {
        let registry = SubscriberRegistry::new(8);
        let delivered = registry.deliver("b1\n".into()).await.unwrap();
        assert_eq!(delivered, 0);
    }
}
