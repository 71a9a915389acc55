//! Per-camera publish/subscribe with a latest-state cache.
//!
//! Publishing never blocks: each subscriber owns a bounded queue and a full
//! queue loses that one delivery. New subscribers receive the cached latest
//! state for their camera immediately.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 50;

struct Subscriber<T> {
    id: u64,
    tx: Sender<T>,
}

struct Inner<T> {
    subscribers: HashMap<String, Vec<Subscriber<T>>>,
    latest: BTreeMap<String, T>,
}

pub struct Broadcaster<T> {
    inner: Mutex<Inner<T>>,
    queue_size: usize,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

/// Receiving end handed to a subscriber.
pub struct Subscription<T> {
    id: u64,
    camera_id: String,
    rx: Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn try_recv(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// `Ok(None)` on timeout, an error once the subscription was removed.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("subscription {} on {} closed", self.id, self.camera_id))
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl<T: Clone + Send> Broadcaster<T> {
    pub fn new() -> Self {
        Self::with_queue_size(DEFAULT_SUBSCRIBER_QUEUE)
    }

    pub fn with_queue_size(queue_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: HashMap::new(),
                latest: BTreeMap::new(),
            }),
            queue_size: queue_size.max(1),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn subscribe(&self, camera_id: &str) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(self.queue_size);
        let mut inner = self.lock();
        if let Some(latest) = inner.latest.get(camera_id) {
            let _ = tx.try_send(latest.clone());
        }
        inner
            .subscribers
            .entry(camera_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        log::debug!("broadcast: subscriber {} joined {}", id, camera_id);
        Subscription {
            id,
            camera_id: camera_id.to_string(),
            rx,
        }
    }

    pub fn unsubscribe(&self, subscription: &Subscription<T>) {
        let mut inner = self.lock();
        if let Some(subscribers) = inner.subscribers.get_mut(&subscription.camera_id) {
            subscribers.retain(|s| s.id != subscription.id);
            if subscribers.is_empty() {
                inner.subscribers.remove(&subscription.camera_id);
            }
        }
        log::debug!(
            "broadcast: subscriber {} left {}",
            subscription.id,
            subscription.camera_id
        );
    }

    /// Cache `message` as the camera's latest state and offer it to every
    /// subscriber. Returns the number of subscribers that accepted it.
    pub fn broadcast(&self, camera_id: &str, message: T) -> usize {
        let mut inner = self.lock();
        let mut delivered = 0;
        if let Some(subscribers) = inner.subscribers.get_mut(camera_id) {
            subscribers.retain(|subscriber| match subscriber.tx.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    log::warn!(
                        "broadcast: subscriber {} on {} is full, message dropped ({} total)",
                        subscriber.id,
                        camera_id,
                        dropped
                    );
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
        }
        inner.latest.insert(camera_id.to_string(), message);
        delivered
    }

    pub fn latest(&self, camera_id: &str) -> Option<T> {
        self.lock().latest.get(camera_id).cloned()
    }

    pub fn latest_states(&self) -> BTreeMap<String, T> {
        self.lock().latest.clone()
    }

    /// Drop a camera's cached state and close its subscriptions.
    pub fn forget(&self, camera_id: &str) {
        let mut inner = self.lock();
        inner.latest.remove(camera_id);
        inner.subscribers.remove(camera_id);
    }

    pub fn subscriber_count(&self, camera_id: &str) -> usize {
        self.lock().subscribers.get(camera_id).map_or(0, Vec::len)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T: Clone + Send> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn late_subscriber_gets_cached_state() {
        let hub: Broadcaster<Value> = Broadcaster::new();
        assert_eq!(hub.broadcast("cam1", json!({"state": "initial"})), 0);
        let sub = hub.subscribe("cam1");
        assert_eq!(sub.try_recv(), Some(json!({"state": "initial"})));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn default_hub_uses_the_standard_queue() {
        let hub: Broadcaster<u32> = Broadcaster::default();
        let sub = hub.subscribe("cam1");
        for n in 0..DEFAULT_SUBSCRIBER_QUEUE as u32 + 5 {
            hub.broadcast("cam1", n);
        }
        assert_eq!(sub.pending(), DEFAULT_SUBSCRIBER_QUEUE);
        assert_eq!(hub.dropped(), 5);
    }

    #[test]
    fn full_subscriber_does_not_block_others() {
        let hub: Broadcaster<u32> = Broadcaster::with_queue_size(2);
        let slow = hub.subscribe("cam1");
        let fast = hub.subscribe("cam1");

        for n in 0..5 {
            hub.broadcast("cam1", n);
            assert_eq!(fast.try_recv(), Some(n));
        }
        // The slow subscriber kept the first two and lost the rest for good.
        assert_eq!(slow.try_recv(), Some(0));
        assert_eq!(slow.try_recv(), Some(1));
        assert_eq!(slow.try_recv(), None);
        assert_eq!(hub.dropped(), 3);

        hub.broadcast("cam1", 9);
        assert_eq!(slow.try_recv(), Some(9));
    }

    #[test]
    fn cameras_are_isolated() {
        let hub: Broadcaster<&'static str> = Broadcaster::new();
        let a = hub.subscribe("a");
        let b = hub.subscribe("b");
        hub.broadcast("a", "hello");
        assert_eq!(a.try_recv(), Some("hello"));
        assert_eq!(b.try_recv(), None);
        assert_eq!(hub.latest("b"), None);
    }

    #[test]
    fn unsubscribed_queue_gets_nothing_more() {
        let hub: Broadcaster<u32> = Broadcaster::new();
        let sub = hub.subscribe("cam1");
        hub.unsubscribe(&sub);
        assert_eq!(hub.broadcast("cam1", 1), 0);
        assert_eq!(sub.try_recv(), None);
        assert_eq!(hub.subscriber_count("cam1"), 0);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let hub: Broadcaster<u32> = Broadcaster::new();
        let sub = hub.subscribe("cam1");
        drop(sub);
        hub.broadcast("cam1", 1);
        assert_eq!(hub.subscriber_count("cam1"), 0);
        assert_eq!(hub.latest("cam1"), Some(1));
    }
}
