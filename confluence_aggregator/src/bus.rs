//! Synchronous notification bus for producer membership changes.
//!
//! Handlers are indexed first by [`Kind`] and then either by producer key or
//! in a wildcard bucket that matches every key. [`Bus::publish`] runs every
//! matching handler inline, in registration order, before returning. The
//! index lock is released before any handler runs so handlers are free to
//! subscribe and unsubscribe themselves.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The two kinds of membership change.
pub(crate) enum Kind {
    /// A producer was registered under a key.
    Added,
    /// The producer under a key was removed.
    Removed,
}

#[derive(Debug, Clone)]
/// A membership change, delivered to handlers and then discarded.
pub(crate) enum Notification<P> {
    /// `producer` is now registered under `key`.
    Added {
        /// Registration key
        key: String,
        /// The producer itself
        producer: P,
    },
    /// Whatever was registered under `key` is gone.
    Removed {
        /// Registration key
        key: String,
    },
}

impl<P> Notification<P> {
    pub(crate) fn kind(&self) -> Kind {
        match self {
            Notification::Added { .. } => Kind::Added,
            Notification::Removed { .. } => Kind::Removed,
        }
    }

    pub(crate) fn key(&self) -> &str {
        match self {
            Notification::Added { key, .. } | Notification::Removed { key } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Narrows a subscription to one [`Kind`] and, optionally, one key.
pub(crate) struct Filter {
    kind: Kind,
    key: Option<String>,
}

impl Filter {
    /// Match every `Added` notification.
    pub(crate) fn added() -> Self {
        Self {
            kind: Kind::Added,
            key: None,
        }
    }

    /// Match every `Removed` notification.
    pub(crate) fn removed() -> Self {
        Self {
            kind: Kind::Removed,
            key: None,
        }
    }

    /// Restrict this filter to notifications about `key`.
    pub(crate) fn with_key<S: Into<String>>(mut self, key: S) -> Self {
        self.key = Some(key.into());
        self
    }
}

type Handler<P> = Arc<dyn Fn(&Notification<P>) + Send + Sync>;

struct Entry<P> {
    id: u64,
    handler: Handler<P>,
}

struct Bucket<P> {
    any: Vec<Entry<P>>,
    keyed: FxHashMap<String, Vec<Entry<P>>>,
}

impl<P> Default for Bucket<P> {
    fn default() -> Self {
        Self {
            any: Vec::new(),
            keyed: FxHashMap::default(),
        }
    }
}

impl<P> Bucket<P> {
    fn matching(&self, key: &str) -> Vec<(u64, Handler<P>)> {
        let keyed = self.keyed.get(key).map_or(&[][..], Vec::as_slice);
        let mut handlers: Vec<(u64, Handler<P>)> = self
            .any
            .iter()
            .chain(keyed)
            .map(|entry| (entry.id, Arc::clone(&entry.handler)))
            .collect();
        // Both lists are individually in id order; merge them back into
        // registration order.
        handlers.sort_unstable_by_key(|(id, _)| *id);
        handlers
    }

    fn take(&mut self, key: Option<&str>, id: u64) -> Option<Entry<P>> {
        match key {
            None => {
                let position = self.any.iter().position(|entry| entry.id == id)?;
                Some(self.any.remove(position))
            }
            Some(key) => {
                let entries = self.keyed.get_mut(key)?;
                let position = entries.iter().position(|entry| entry.id == id)?;
                let entry = entries.remove(position);
                if entries.is_empty() {
                    self.keyed.remove(key);
                }
                Some(entry)
            }
        }
    }

    fn len(&self) -> usize {
        self.any.len() + self.keyed.values().map(Vec::len).sum::<usize>()
    }
}

struct Index<P> {
    next_id: u64,
    added: Bucket<P>,
    removed: Bucket<P>,
}

impl<P> Index<P> {
    fn bucket(&self, kind: Kind) -> &Bucket<P> {
        match kind {
            Kind::Added => &self.added,
            Kind::Removed => &self.removed,
        }
    }

    fn bucket_mut(&mut self, kind: Kind) -> &mut Bucket<P> {
        match kind {
            Kind::Added => &mut self.added,
            Kind::Removed => &mut self.removed,
        }
    }
}

/// The notification bus. Cloning yields another handle to the same bus.
pub(crate) struct Bus<P> {
    index: Arc<Mutex<Index<P>>>,
}

impl<P> Clone for Bus<P> {
    fn clone(&self) -> Self {
        Self {
            index: Arc::clone(&self.index),
        }
    }
}

impl<P> std::fmt::Debug for Bus<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("subscriptions", &self.len())
            .finish()
    }
}

fn lock<P>(index: &Mutex<Index<P>>) -> MutexGuard<'_, Index<P>> {
    index.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P> Bus<P> {
    pub(crate) fn new() -> Self {
        Self {
            index: Arc::new(Mutex::new(Index {
                next_id: 0,
                added: Bucket::default(),
                removed: Bucket::default(),
            })),
        }
    }

    /// Register `handler` for every notification matching `filter`.
    ///
    /// The handler stays registered until the returned [`Subscription`] is
    /// unsubscribed or dropped.
    #[must_use]
    pub(crate) fn subscribe<F>(&self, filter: Filter, handler: F) -> Subscription<P>
    where
        F: Fn(&Notification<P>) + Send + Sync + 'static,
    {
        let mut index = lock(&self.index);
        let id = index.next_id;
        index.next_id += 1;

        let entry = Entry {
            id,
            handler: Arc::new(handler),
        };
        let bucket = index.bucket_mut(filter.kind);
        match &filter.key {
            None => bucket.any.push(entry),
            Some(key) => bucket.keyed.entry(key.clone()).or_default().push(entry),
        }

        Subscription {
            index: Arc::downgrade(&self.index),
            filter,
            id,
        }
    }

    /// Deliver `notification` to every matching handler, returning the
    /// number of handlers run.
    pub(crate) fn publish(&self, notification: &Notification<P>) -> usize {
        let handlers = lock(&self.index)
            .bucket(notification.kind())
            .matching(notification.key());

        for (_, handler) in &handlers {
            handler(notification);
        }
        handlers.len()
    }

    /// Total number of live subscriptions.
    pub(crate) fn len(&self) -> usize {
        let index = lock(&self.index);
        index.added.len() + index.removed.len()
    }
}

/// Handle to a registered handler. Dropping it unsubscribes.
pub(crate) struct Subscription<P> {
    index: Weak<Mutex<Index<P>>>,
    filter: Filter,
    id: u64,
}

impl<P> std::fmt::Debug for Subscription<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter)
            .field("id", &self.id)
            .finish()
    }
}

impl<P> Subscription<P> {
    /// Remove the handler from the bus. A publish already in flight may
    /// still run it once.
    pub(crate) fn unsubscribe(self) {
        drop(self);
    }
}

impl<P> Drop for Subscription<P> {
    fn drop(&mut self) {
        // If the bus is gone there is nothing left to remove from. The
        // handler is dropped outside the lock: it may own other
        // subscriptions whose drop would need the lock again.
        let Some(index) = self.index.upgrade() else {
            return;
        };
        let removed = {
            let mut index = lock(&index);
            index
                .bucket_mut(self.filter.kind)
                .take(self.filter.key.as_deref(), self.id)
        };
        drop(removed);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicU64, Ordering},
        },
        thread,
        time::Duration,
    };

    use proptest::prelude::*;

    use super::*;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recorder(log: &Log, name: &'static str) -> impl Fn(&Notification<()>) + Send + Sync + use<> {
        let log = Arc::clone(log);
        move |_| log.lock().expect("mutex poisoned").push(name)
    }

    fn added(key: &str) -> Notification<()> {
        Notification::Added {
            key: key.to_string(),
            producer: (),
        }
    }

    fn removed(key: &str) -> Notification<()> {
        Notification::Removed {
            key: key.to_string(),
        }
    }

    #[test]
    fn dispatch_respects_kind_and_key() {
        let bus = Bus::new();
        let log: Log = Arc::default();

        let _a = bus.subscribe(Filter::added(), recorder(&log, "added-any"));
        let _b = bus.subscribe(Filter::added().with_key("x"), recorder(&log, "added-x"));
        let _c = bus.subscribe(Filter::removed(), recorder(&log, "removed-any"));
        let _d = bus.subscribe(Filter::removed().with_key("y"), recorder(&log, "removed-y"));

        assert_eq!(bus.publish(&added("x")), 2);
        assert_eq!(bus.publish(&added("y")), 1);
        assert_eq!(bus.publish(&removed("x")), 1);
        assert_eq!(bus.publish(&removed("y")), 2);

        let log = log.lock().expect("mutex poisoned");
        assert_eq!(
            *log,
            vec![
                "added-any",
                "added-x",
                "added-any",
                "removed-any",
                "removed-any",
                "removed-y"
            ]
        );
    }

    #[test]
    fn keyed_and_wildcard_handlers_run_in_registration_order() {
        let bus = Bus::new();
        let log: Log = Arc::default();

        let _a = bus.subscribe(Filter::added().with_key("k"), recorder(&log, "first"));
        let _b = bus.subscribe(Filter::added(), recorder(&log, "second"));
        let _c = bus.subscribe(Filter::added().with_key("k"), recorder(&log, "third"));

        bus.publish(&added("k"));
        assert_eq!(
            *log.lock().expect("mutex poisoned"),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn unsubscribe_removes_only_that_handler() {
        let bus = Bus::new();
        let log: Log = Arc::default();

        let a = bus.subscribe(Filter::removed().with_key("k"), recorder(&log, "a"));
        let _b = bus.subscribe(Filter::removed().with_key("k"), recorder(&log, "b"));
        assert_eq!(bus.len(), 2);

        a.unsubscribe();
        assert_eq!(bus.len(), 1);

        bus.publish(&removed("k"));
        assert_eq!(*log.lock().expect("mutex poisoned"), vec!["b"]);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus: Bus<()> = Bus::new();
        assert_eq!(bus.publish(&removed("never-added")), 0);
    }

    #[test]
    fn handlers_may_subscribe_during_publish() {
        let bus: Bus<()> = Bus::new();
        let inner_bus = bus.clone();
        let held = Arc::new(Mutex::new(Vec::new()));
        let held_inner = Arc::clone(&held);

        let _outer = bus.subscribe(Filter::added(), move |n| {
            let sub = inner_bus.subscribe(Filter::removed().with_key(n.key()), |_| {});
            held_inner.lock().expect("mutex poisoned").push(sub);
        });

        bus.publish(&added("a"));
        bus.publish(&added("b"));
        assert_eq!(bus.len(), 3);

        held.lock().expect("mutex poisoned").clear();
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn subscription_outliving_bus_drops_cleanly() {
        let bus: Bus<()> = Bus::new();
        let sub = bus.subscribe(Filter::added(), |_| {});
        drop(bus);
        sub.unsubscribe();
    }

    #[test]
    fn concurrent_publish_and_unsubscribe_settle() {
        const PUBLISHERS: u64 = 4;
        const SUBSCRIBERS: usize = 4;
        const ROUNDS: usize = 500;

        let (done_tx, done_rx) = flume::bounded(1);
        thread::spawn(move || {
            let bus: Bus<()> = Bus::new();
            let _resident = bus.subscribe(Filter::added(), |_| {});
            let baseline = bus.len();
            let stop = AtomicBool::new(false);

            // Each entry is the run count observed when `unsubscribe`
            // returned, and the live counter.
            let retired: Vec<(u64, Arc<AtomicU64>)> = thread::scope(|scope| {
                for publisher in 0..PUBLISHERS {
                    let bus = &bus;
                    let stop = &stop;
                    scope.spawn(move || {
                        let mut round: u64 = 0;
                        while !stop.load(Ordering::Relaxed) {
                            let key = ((publisher + round) % 4).to_string();
                            if round % 2 == 0 {
                                bus.publish(&added(&key));
                            } else {
                                bus.publish(&removed(&key));
                            }
                            round += 1;
                        }
                    });
                }

                let subscribers: Vec<_> = (0..SUBSCRIBERS)
                    .map(|subscriber| {
                        let bus = &bus;
                        scope.spawn(move || {
                            let mut retired = Vec::with_capacity(ROUNDS);
                            for round in 0..ROUNDS {
                                let filter = match (subscriber + round) % 3 {
                                    0 => Filter::added(),
                                    1 => Filter::removed(),
                                    _ => Filter::removed().with_key((round % 4).to_string()),
                                };
                                let runs = Arc::new(AtomicU64::new(0));
                                let counted = Arc::clone(&runs);
                                let inner = bus.clone();
                                let subscription = bus.subscribe(filter, move |_| {
                                    // Takes the index lock; would deadlock if
                                    // publish held it while running handlers.
                                    let _ = inner.len();
                                    counted.fetch_add(1, Ordering::SeqCst);
                                });
                                thread::yield_now();
                                subscription.unsubscribe();
                                retired.push((runs.load(Ordering::SeqCst), runs));
                            }
                            retired
                        })
                    })
                    .collect();

                let retired: Vec<(u64, Arc<AtomicU64>)> = subscribers
                    .into_iter()
                    .flat_map(|handle| handle.join().expect("subscriber panicked"))
                    .collect();
                stop.store(true, Ordering::Relaxed);
                retired
            });

            // Every publisher has exited. A handler can only have run late
            // from a publish that snapshotted it before the unsubscribe, at
            // most one per publisher.
            for (at_unsubscribe, runs) in &retired {
                let late = runs.load(Ordering::SeqCst) - at_unsubscribe;
                assert!(late <= PUBLISHERS, "handler ran {late} times after unsubscribe");
            }
            assert_eq!(bus.len(), baseline);
            let _ = done_tx.send(());
        });

        match done_rx.recv_timeout(Duration::from_secs(60)) {
            Ok(()) => {}
            Err(flume::RecvTimeoutError::Timeout) => panic!("bus did not settle, deadlock"),
            Err(flume::RecvTimeoutError::Disconnected) => panic!("bus stress thread panicked"),
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Subscribe { added: bool, key: Option<u8> },
        Unsubscribe(usize),
        Publish { added: bool, key: u8 },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<bool>(), proptest::option::of(0u8..4))
                .prop_map(|(added, key)| Op::Subscribe { added, key }),
            any::<usize>().prop_map(Op::Unsubscribe),
            (any::<bool>(), 0u8..4).prop_map(|(added, key)| Op::Publish { added, key }),
        ]
    }

    proptest! {
        // The bus delivers a notification to exactly the live subscriptions
        // whose filter matches, as computed by a linear scan over a model.
        #[test]
        fn publish_matches_linear_scan(ops in proptest::collection::vec(op(), 1..64)) {
            let bus: Bus<()> = Bus::new();
            let mut live: Vec<(bool, Option<u8>, Subscription<()>)> = Vec::new();

            for op in ops {
                match op {
                    Op::Subscribe { added, key } => {
                        let mut filter = if added { Filter::added() } else { Filter::removed() };
                        if let Some(key) = key {
                            filter = filter.with_key(key.to_string());
                        }
                        live.push((added, key, bus.subscribe(filter, |_| {})));
                    }
                    Op::Unsubscribe(idx) => {
                        if !live.is_empty() {
                            let (_, _, sub) = live.remove(idx % live.len());
                            sub.unsubscribe();
                        }
                    }
                    Op::Publish { added, key } => {
                        let notification = if added {
                            Notification::Added { key: key.to_string(), producer: () }
                        } else {
                            Notification::Removed { key: key.to_string() }
                        };
                        let expected = live
                            .iter()
                            .filter(|(a, k, _)| *a == added && k.is_none_or(|k| k == key))
                            .count();
                        prop_assert_eq!(bus.publish(&notification), expected);
                    }
                }
                prop_assert_eq!(bus.len(), live.len());
            }
        }
    }
}
