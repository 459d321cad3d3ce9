//! Topic-keyed listener registry for device events.
//!
//! Subscribing returns a [`SubscriptionHandle`]; unsubscribing through the
//! handle is idempotent and also happens on drop. A listener is an unbounded
//! channel sender, so publishing never blocks and never awaits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::devices::{DeviceEvent, Topic};

type Listener = (u64, mpsc::UnboundedSender<DeviceEvent>);

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<Topic, Vec<Listener>>>,
    /// Listeners removed through a handle. Pruned dead senders do not count.
    removed: AtomicU64,
}

impl BusInner {
    fn remove(&self, topic: &Topic, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(list) = listeners.get_mut(topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(topic);
        }
        if removed {
            self.removed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        topic: Topic,
        tx: mpsc::UnboundedSender<DeviceEvent>,
    ) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .entry(topic.clone())
            .or_default()
            .push((id, tx));
        SubscriptionHandle {
            bus: Arc::downgrade(&self.inner),
            topic,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Deliver to every listener of the event's topic. Returns the number of
    /// listeners reached; listeners whose receiver is gone are pruned.
    pub fn publish(&self, event: DeviceEvent) -> usize {
        let topic = event.topic();
        let mut listeners = self.inner.listeners.lock();
        let Some(list) = listeners.get_mut(&topic) else {
            return 0;
        };
        list.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        let delivered = list.len();
        if list.is_empty() {
            listeners.remove(&topic);
        }
        delivered
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().values().map(Vec::len).sum()
    }

    pub fn listener_count_for(&self, topic: &Topic) -> usize {
        self.inner
            .listeners
            .lock()
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn removed_count(&self) -> u64 {
        self.inner.removed.load(Ordering::Relaxed)
    }
}

/// One registered listener. Unsubscribes at most once.
pub struct SubscriptionHandle {
    bus: Weak<BusInner>,
    topic: Topic,
    id: u64,
    active: AtomicBool,
}

impl SubscriptionHandle {
    /// `true` only for the call that actually removed the listener.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        match self.bus.upgrade() {
            Some(inner) => inner.remove(&self.topic, self.id),
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
