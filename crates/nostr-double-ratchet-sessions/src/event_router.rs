use crate::utils::lock;
use crate::Unsubscribe;
use nostr::{PublicKey, UnsignedEvent};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub type EventObserver = Arc<dyn Fn(&UnsignedEvent, PublicKey) + Send + Sync>;

/// Fans decrypted inbound events out to registered observers.
///
/// Observer ids come from a monotonic generation counter, so a disposer
/// called late (or twice) can never remove a newer observer.
#[derive(Default)]
pub struct EventRouter {
    next_id: AtomicU64,
    observers: Mutex<BTreeMap<u64, EventObserver>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(self: &Arc<Self>, observer: EventObserver) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.observers).insert(id, observer);

        let router: Weak<Self> = Arc::downgrade(self);
        Box::new(move || {
            if let Some(router) = router.upgrade() {
                lock(&router.observers).remove(&id);
            }
        })
    }

    /// Delivers to a snapshot of the observers, so callbacks may subscribe
    /// or unsubscribe without deadlocking.
    pub fn dispatch(&self, event: &UnsignedEvent, from: PublicKey) {
        let snapshot: Vec<EventObserver> = lock(&self.observers).values().cloned().collect();
        for observer in snapshot {
            observer(event, from);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.observers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.observers).clear();
    }
}
