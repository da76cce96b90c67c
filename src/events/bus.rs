//! Multi-consumer publish/subscribe for sampled property values.
//!
//! One producer (the telemetry sampler) fans values out to N independent
//! consumers (SSE streams). Each subscriber owns an isolated bounded queue;
//! a full queue drops the event for that subscriber only, so a stalled
//! client never blocks the publisher or its peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::modbus::PropertyValue;

/// Per-subscriber queue capacity.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 100;

/// How long a subscriber blocks per receive attempt before yielding, so the
/// SSE handler can notice a torn-down stream.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// One sampled reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyEvent {
    pub name: String,
    pub value: PropertyValue,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

type SubscriberMap = HashMap<u64, mpsc::Sender<PropertyEvent>>;

/// Sampler-to-consumers fan-out bus.
#[derive(Default)]
pub struct EventBus {
    /// Shared with every [`Subscription`] so a dropped consumer can remove
    /// itself without waiting for the next publish.
    subscribers: Arc<Mutex<SubscriberMap>>,
    next_id: AtomicU64,
}

fn lock_subscribers(registry: &Mutex<SubscriberMap>) -> MutexGuard<'_, SubscriberMap> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an opaque subscriber identity for a new consumer.
    pub fn next_subscriber_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates the subscription for `id`. Idempotent per id: a second call
    /// for a live subscriber returns `None` and keeps the existing queue.
    pub fn subscribe(&self, id: u64) -> Option<Subscription> {
        let mut subscribers = lock_subscribers(&self.subscribers);
        if subscribers.contains_key(&id) {
            return None;
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        subscribers.insert(id, tx);
        debug!(subscriber = id, "subscribed to property events");
        Some(Subscription { id, rx, registry: self.subscribers.clone() })
    }

    /// Removes and discards the subscription.
    pub fn unsubscribe(&self, id: u64) {
        if lock_subscribers(&self.subscribers).remove(&id).is_some() {
            debug!(subscriber = id, "unsubscribed from property events");
        }
    }

    /// Broadcasts to all current subscriptions. Never blocks and never
    /// fails: a full queue drops the event for that subscriber, a closed
    /// queue (dropped consumer) removes the subscription.
    pub fn publish(&self, event: PropertyEvent) {
        let mut subscribers = lock_subscribers(&self.subscribers);
        let mut gone = Vec::new();
        for (id, tx) in subscribers.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {},
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = *id, property = %event.name, "subscriber queue full, dropping event");
                },
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*id),
            }
        }
        for id in gone {
            subscribers.remove(&id);
            debug!(subscriber = id, "dropped closed subscription");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock_subscribers(&self.subscribers).len()
    }
}

/// Consumer end of one subscription. Dropping it removes the subscriber
/// from the bus, so an idle bus never accumulates dead queues.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<PropertyEvent>,
    registry: Arc<Mutex<SubscriberMap>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Blocks up to [`RECV_TIMEOUT`] and returns `None` on timeout.
    pub async fn recv(&mut self) -> Option<PropertyEvent> {
        match tokio::time::timeout(RECV_TIMEOUT, self.rx.recv()).await {
            Ok(event) => event,
            Err(_) => None,
        }
    }

    /// Non-blocking receive used by tests and drain loops.
    pub fn try_recv(&mut self) -> Option<PropertyEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if lock_subscribers(&self.registry).remove(&self.id).is_some() {
            debug!(subscriber = self.id, "subscription dropped, removed from bus");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, value: f64) -> PropertyEvent {
        PropertyEvent {
            name: name.to_string(),
            value: PropertyValue::Scalar(value),
            timestamp: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn events_fan_out_to_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(1).unwrap();
        let mut b = bus.subscribe(2).unwrap();

        bus.publish(event("temp", 21.5));

        assert_eq!(a.try_recv().unwrap().name, "temp");
        assert_eq!(b.try_recv().unwrap().name, "temp");
    }

    #[tokio::test]
    async fn subscribing_twice_keeps_the_existing_queue() {
        let bus = EventBus::new();
        let _sub = bus.subscribe(7).unwrap();
        assert!(bus.subscribe(7).is_none());
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_then_subscribe_yields_fresh_empty_queue() {
        let bus = EventBus::new();
        let old = bus.subscribe(3).unwrap();
        bus.publish(event("temp", 1.0));
        bus.unsubscribe(3);

        let mut fresh = bus.subscribe(3).unwrap();
        assert!(fresh.try_recv().is_none());
        drop(old);
    }

    #[tokio::test]
    async fn full_queue_drops_events_without_blocking_publisher() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(1).unwrap();

        for i in 0..(SUBSCRIBER_QUEUE_CAPACITY + 10) {
            bus.publish(event("temp", i as f64));
        }

        // Exactly the first CAPACITY events are retained, in FIFO order.
        let mut received = Vec::new();
        while let Some(e) = sub.try_recv() {
            received.push(e.value.as_scalar().unwrap());
        }
        assert_eq!(received.len(), SUBSCRIBER_QUEUE_CAPACITY);
        assert_eq!(received[0], 0.0);
        assert_eq!(received[SUBSCRIBER_QUEUE_CAPACITY - 1], (SUBSCRIBER_QUEUE_CAPACITY - 1) as f64);
    }

    #[tokio::test]
    async fn full_queue_does_not_affect_other_subscribers() {
        let bus = EventBus::new();
        let mut stalled = bus.subscribe(1).unwrap();
        let mut healthy = bus.subscribe(2).unwrap();

        for i in 0..SUBSCRIBER_QUEUE_CAPACITY {
            bus.publish(event("temp", i as f64));
            // Healthy consumer drains as it goes.
            assert!(healthy.try_recv().is_some());
        }
        bus.publish(event("temp", -1.0));

        assert_eq!(healthy.try_recv().unwrap().value, PropertyValue::Scalar(-1.0));
        // The stalled subscriber kept its first 100 and lost the rest.
        assert!(stalled.try_recv().is_some());
    }

    #[tokio::test]
    async fn dropping_a_subscription_removes_it_without_a_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe(1).unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        // No publish in between: the drop alone must clean up.
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn reconnecting_consumers_do_not_accumulate_queues() {
        let bus = EventBus::new();
        for _ in 0..50 {
            let id = bus.next_subscriber_id();
            let sub = bus.subscribe(id).unwrap();
            drop(sub);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn recv_times_out_on_idle_bus() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(1).unwrap();

        tokio::time::pause();
        let recv = tokio::spawn(async move { sub.recv().await });
        tokio::time::advance(RECV_TIMEOUT + Duration::from_millis(10)).await;
        assert!(recv.await.unwrap().is_none());
    }
}
