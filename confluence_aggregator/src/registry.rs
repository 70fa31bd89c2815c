//! The set of currently registered producers.
//!
//! The registry is never written directly. It holds two standing bus
//! subscriptions and updates itself as a side effect of every add and remove
//! notification, so a new session can start from a consistent snapshot.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;

use crate::bus::{Bus, Filter, Notification, Subscription};

type Producers<P> = Arc<Mutex<FxHashMap<String, P>>>;

fn lock<P>(producers: &Mutex<FxHashMap<String, P>>) -> MutexGuard<'_, FxHashMap<String, P>> {
    producers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Producers by key, kept in sync with the bus.
pub(crate) struct Registry<P> {
    producers: Producers<P>,
    _on_added: Subscription<P>,
    _on_removed: Subscription<P>,
}

impl<P> std::fmt::Debug for Registry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("keys", &self.keys())
            .finish_non_exhaustive()
    }
}

impl<P> Registry<P>
where
    P: Clone + Send + 'static,
{
    /// Create an empty registry listening on `bus`.
    pub(crate) fn new(bus: &Bus<P>) -> Self {
        let producers: Producers<P> = Arc::default();

        let added = Arc::clone(&producers);
        let on_added = bus.subscribe(Filter::added(), move |notification| {
            if let Notification::Added { key, producer } = notification {
                // Last write wins. A session may already run a task against
                // the previous producer under this key.
                lock(&added).insert(key.clone(), producer.clone());
            }
        });

        let removed = Arc::clone(&producers);
        let on_removed = bus.subscribe(Filter::removed(), move |notification| {
            lock(&removed).remove(notification.key());
        });

        Self {
            producers,
            _on_added: on_added,
            _on_removed: on_removed,
        }
    }

    /// A copy of every registered producer with its key.
    pub(crate) fn snapshot(&self) -> Vec<(String, P)> {
        lock(&self.producers)
            .iter()
            .map(|(key, producer)| (key.clone(), producer.clone()))
            .collect()
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        lock(&self.producers).contains_key(key)
    }
}

impl<P> Registry<P> {
    /// The keys currently registered, in no particular order.
    pub(crate) fn keys(&self) -> Vec<String> {
        lock(&self.producers).keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.producers).len()
    }
}
