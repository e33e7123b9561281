//! Typed signals for change notifications.
//!
//! A [`Signal`] is a small callback registry: subscribers register a closure
//! and receive a reference to every emitted payload. Emission is synchronous,
//! in subscription order, and a panicking subscriber does not prevent the
//! others from running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexMap;

/// A unique identifier for a subscription.
pub type SubscriptionId = u64;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Registry of callbacks for one kind of payload.
pub struct Signal<T> {
    callbacks: RwLock<IndexMap<SubscriptionId, Callback<T>>>,
    next_id: AtomicU64,
}

impl<T> Signal<T> {
    /// Create a signal with no subscribers.
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(IndexMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to the signal.
    ///
    /// Returns a subscription ID that can be used to unsubscribe later.
    pub fn on<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(callback));
        id
    }

    /// Unsubscribe. Returns `true` if the subscription was found and removed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(&id)
            .is_some()
    }

    /// Emit a payload to all subscribers.
    pub fn emit(&self, payload: &T) {
        // Snapshot so callbacks may subscribe or unsubscribe while we iterate.
        let callbacks: Vec<Callback<T>> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for callback in callbacks {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(payload);
            }));
            if result.is_err() {
                log::warn!("signal subscriber panicked; continuing with the rest");
            }
        }
    }

    /// Get the number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop every subscription.
    pub fn dispose(&self) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
