//! Multicast of decoded product changes to every live subscriber.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use stock_core::{ProductChangeEvent, SubscriptionId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

struct Subscriber {
    tx: mpsc::Sender<ProductChangeEvent>,
    dropped: Arc<AtomicU64>,
}

struct HubInner {
    subscribers: DashMap<SubscriptionId, Subscriber>,
    capacity: usize,
    closed: AtomicBool,
    published: AtomicU64,
}

/// One producer, many consumers. Cheap to clone.
///
/// Each subscriber owns a bounded queue. A full queue drops the new event for
/// that subscriber only, so `publish` never waits on a slow consumer.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: DashMap::new(),
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Register a subscriber. It sees every event published from now on.
    ///
    /// After [`shutdown_all`](Self::shutdown_all) the returned subscription is
    /// already completed.
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriptionId::new();
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        if self.inner.closed.load(Ordering::SeqCst) {
            return Subscription::detached(id, rx, dropped);
        }

        self.inner.subscribers.insert(
            id.clone(),
            Subscriber {
                tx,
                dropped: Arc::clone(&dropped),
            },
        );

        // shutdown_all may have cleared the map between the check and the insert.
        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.subscribers.remove(&id);
        } else {
            tracing::debug!(subscription_id = %id, "subscriber registered");
        }

        Subscription {
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
            dropped,
        }
    }

    /// Offer `event` to every subscriber. Returns how many accepted it.
    pub fn publish(&self, event: ProductChangeEvent) -> usize {
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut gone = Vec::new();

        for entry in self.inner.subscribers.iter() {
            match entry.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    let total = entry.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        subscription_id = %entry.key(),
                        ean = %event.ean,
                        dropped_total = total,
                        "subscriber queue full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => gone.push(entry.key().clone()),
            }
        }

        for id in gone {
            if self.inner.subscribers.remove(&id).is_some() {
                tracing::debug!(subscription_id = %id, "pruned closed subscriber");
            }
        }

        delivered
    }

    /// Stop delivering to `id`. True only for the call that removed it.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.inner.unsubscribe(id)
    }

    /// Complete every live subscription and refuse new ones.
    pub fn shutdown_all(&self) -> usize {
        let first = !self.inner.closed.swap(true, Ordering::SeqCst);
        let count = self.inner.subscribers.len();
        self.inner.subscribers.clear();
        if first {
            tracing::info!(subscribers = count, "broadcast hub shut down");
        }
        count
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Events offered since creation.
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.is_shut_down())
            .finish()
    }
}

impl HubInner {
    fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let removed = self.subscribers.remove(id).is_some();
        if removed {
            tracing::debug!(subscription_id = %id, "subscriber removed");
        }
        removed
    }
}

/// Receiving end of one hub registration. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<ProductChangeEvent>,
    hub: Weak<HubInner>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    fn detached(
        id: SubscriptionId,
        mut rx: mpsc::Receiver<ProductChangeEvent>,
        dropped: Arc<AtomicU64>,
    ) -> Self {
        rx.close();
        Self {
            id,
            rx,
            hub: Weak::new(),
            dropped,
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// The hub this subscription is registered with. `None` when the hub
    /// is gone or was already shut down at subscribe time.
    pub fn hub(&self) -> Option<BroadcastHub> {
        self.hub.upgrade().map(|inner| BroadcastHub { inner })
    }

    /// Next event, or `None` once unsubscribed (or the hub shut down) and
    /// the queue is drained.
    pub async fn recv(&mut self) -> Option<ProductChangeEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProductChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Events dropped for this subscriber because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Stream for Subscription {
    type Item = ProductChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(&self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn event(ean: &str, quantity: i64) -> ProductChangeEvent {
        ProductChangeEvent {
            ean: ean.into(),
            name: "Widget".into(),
            quantity,
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers() {
        let hub = BroadcastHub::new(8);
        assert_eq!(hub.publish(event("1", 1)), 0);
        assert_eq!(hub.published(), 1);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event_in_order() {
        let hub = BroadcastHub::new(16);
        let mut subs: Vec<_> = (0..3).map(|_| hub.subscribe()).collect();

        for q in 0..5 {
            assert_eq!(hub.publish(event("1", q)), 3);
        }

        for sub in &mut subs {
            for q in 0..5 {
                assert_eq!(sub.recv().await.unwrap().quantity, q);
            }
        }
    }

    #[tokio::test]
    async fn no_replay_for_late_subscriber() {
        let hub = BroadcastHub::new(8);
        hub.publish(event("1", 1));
        let mut late = hub.subscribe();
        assert!(late.try_recv().is_none());
        hub.publish(event("1", 2));
        assert_eq!(late.recv().await.unwrap().quantity, 2);
    }

    #[tokio::test]
    async fn full_queue_drops_newest_for_that_subscriber_only() {
        let hub = BroadcastHub::new(2);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        hub.publish(event("1", 1));
        hub.publish(event("1", 2));
        assert_eq!(fast.recv().await.unwrap().quantity, 1);
        assert_eq!(fast.recv().await.unwrap().quantity, 2);

        // slow is full now
        assert_eq!(hub.publish(event("1", 3)), 1);
        assert_eq!(slow.dropped(), 1);
        assert_eq!(fast.dropped(), 0);

        assert_eq!(slow.recv().await.unwrap().quantity, 1);
        assert_eq!(slow.recv().await.unwrap().quantity, 2);
        assert!(slow.try_recv().is_none());
        assert_eq!(fast.recv().await.unwrap().quantity, 3);
    }

    #[tokio::test]
    async fn unsubscribe_keeps_queued_events_and_stops_new_ones() {
        let hub = BroadcastHub::new(8);
        let mut sub = hub.subscribe();
        hub.publish(event("1", 1));

        assert!(hub.unsubscribe(sub.id()));
        assert!(!hub.unsubscribe(sub.id()));
        assert_eq!(hub.publish(event("1", 2)), 0);

        assert_eq!(sub.recv().await.unwrap().quantity, 1);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let hub = BroadcastHub::new(8);
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_completes_subscribers_and_refuses_new_ones() {
        let hub = BroadcastHub::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        hub.publish(event("1", 7));

        assert_eq!(hub.shutdown_all(), 2);
        assert!(hub.is_shut_down());
        assert_eq!(a.recv().await.unwrap().quantity, 7);
        assert!(a.recv().await.is_none());
        assert_eq!(b.recv().await.unwrap().quantity, 7);
        assert!(b.recv().await.is_none());

        let mut late = hub.subscribe();
        assert!(late.recv().await.is_none());
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.shutdown_all(), 0);
    }

    #[tokio::test]
    async fn subscription_knows_its_hub() {
        let hub = BroadcastHub::new(8);
        let other = BroadcastHub::new(8);
        let sub = other.subscribe();

        let owner = sub.hub().unwrap();
        assert!(owner.unsubscribe(sub.id()));
        assert_eq!(other.subscriber_count(), 0);
        assert!(!hub.unsubscribe(sub.id()));

        hub.shutdown_all();
        assert!(hub.subscribe().hub().is_none());
    }

    #[tokio::test]
    async fn subscription_is_a_stream() {
        let hub = BroadcastHub::new(8);
        let sub = hub.subscribe();
        hub.publish(event("a", 1));
        hub.publish(event("b", 2));
        hub.shutdown_all();

        let eans: Vec<String> = sub.map(|e| e.ean).collect().await;
        assert_eq!(eans, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_publish_and_subscribe() {
        let hub = BroadcastHub::new(1024);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let hub = hub.clone();
            handles.push(tokio::spawn(async move {
                let mut sub = hub.subscribe();
                let mut seen = 0;
                while sub.recv().await.is_some() {
                    seen += 1;
                }
                seen
            }));
        }
        while hub.subscriber_count() < 8 {
            tokio::task::yield_now().await;
        }
        for q in 0..100 {
            hub.publish(event("1", q));
        }
        hub.shutdown_all();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 100);
        }
    }
}
