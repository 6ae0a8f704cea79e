//! Minimal synchronous observable, independent of any UI framework.
//!
//! A `Subject<T>` notifies listeners synchronously on `emit`; dropping the
//! returned `Subscription` unsubscribes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SubjectInner<T> {
    next_id: u64,
    listeners: HashMap<u64, Listener<T>>,
}

impl<T> Default for SubjectInner<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            listeners: HashMap::new(),
        }
    }
}

/// Multi-listener subject with synchronous notification on emit.
pub struct Subject<T> {
    inner: Arc<Mutex<SubjectInner<T>>>,
}

impl<T> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Subject<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SubjectInner::default())),
        }
    }

    /// Register a listener; it stays active until the `Subscription` drops.
    #[must_use]
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription<T> {
        let mut guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = guard.next_id;
        guard.next_id += 1;
        guard.listeners.insert(id, Arc::new(listener));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Notify all current listeners synchronously.
    ///
    /// Listeners run outside the subject lock, so a listener may subscribe
    /// or unsubscribe without deadlocking.
    pub fn emit(&self, value: &T) {
        let listeners: Vec<Listener<T>> = {
            let guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener(value);
        }
    }

    /// Number of active listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .listeners
            .len()
    }
}

/// Handle for an active listener registration.
pub struct Subscription<T> {
    id: u64,
    inner: Weak<Mutex<SubjectInner<T>>>,
}

impl<T> Subscription<T> {
    /// Explicitly remove the listener (equivalent to dropping).
    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut guard = inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.listeners.remove(&self.id);
        }
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────
