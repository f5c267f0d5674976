/// Synchronous publish/subscribe registry.
///
/// Subscribers register a callback and receive an id used to unsubscribe.
/// `notify` runs every callback registered at the time of the call, in
/// subscription order, on the caller's thread. A panicking callback is
/// caught and logged; the remaining subscribers still run.
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::warn;

pub type SubscriptionId = u64;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Feed<T> {
    name: &'static str,
    next_id: AtomicU64,
    subs: RwLock<BTreeMap<SubscriptionId, Callback<T>>>,
    /// Serializes `notify` so every subscriber sees the same order.
    notify_lock: Mutex<()>,
}

impl<T> Feed<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            subs: RwLock::new(BTreeMap::new()),
            notify_lock: Mutex::new(()),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.write().insert(id, Arc::new(callback));
        id
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subs.write().remove(&id);
    }

    pub fn notify(&self, value: &T) {
        let _ordered = self.notify_lock.lock();

        // Callbacks run without the registry lock so they may (un)subscribe.
        let subs: Vec<(SubscriptionId, Callback<T>)> = self
            .subs
            .read()
            .iter()
            .map(|(id, cb)| (*id, cb.clone()))
            .collect();

        for (id, callback) in subs {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                warn!(feed = self.name, subscription = id, "Subscriber panicked during notify");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.subs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.read().is_empty()
    }
}
