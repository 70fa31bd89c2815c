//! The stream aggregator.
//!
//! [`Aggregator`] multiplexes a changing set of keyed producers into any
//! number of consumer sessions. Every session runs one task per producer,
//! all writing into the session's output channel. Producers may be added and
//! removed while sessions are open: an added producer starts feeding every
//! open session, a removed producer has exactly its own tasks cancelled.
//!
//! ## Metrics
//!
//! `producers_added`: Producers registered
//! `producers_removed`: Producer removals published
//! `producer_tasks_started`: Producer tasks spawned across all sessions
//! `producer_tasks_finished`: Producer tasks that returned
//! `sessions_open`: Sessions not yet closed
//!

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::{runtime::Handle, sync::watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    Output, Producer,
    bus::{Bus, Filter, Notification},
    registry::Registry,
    session::{ConsumeOptions, Session, State},
};

type SharedProducer<R, T> = Arc<dyn Producer<R, T>>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors produced by [`Aggregator`].
pub enum Error {
    /// Producer keys must not be empty.
    #[error("producer key must not be empty")]
    EmptyKey,
    /// A producer is already registered under this key and the aggregator
    /// rejects duplicates.
    #[error("a producer is already registered under key {0:?}")]
    DuplicateKey(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Configuration for [`Aggregator`].
pub struct Config {
    /// Reject `add_producer` for a key that is already registered. When
    /// false, the default, the new producer replaces the old one in the
    /// registry while tasks already running against the old producer keep
    /// running until the key is removed or their session ends.
    #[serde(default)]
    pub reject_duplicate_keys: bool,
}

struct Inner<R, T> {
    config: Config,
    /// Serializes membership changes against session setup and teardown.
    membership: Mutex<()>,
    bus: Bus<SharedProducer<R, T>>,
    registry: Registry<SharedProducer<R, T>>,
}

impl<R, T> Inner<R, T> {
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.membership
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fan-in of keyed producers into consumer sessions.
///
/// `R` is the request handed to every producer of a session, `T` the value
/// type flowing to the consumer. Cloning an `Aggregator` yields another
/// handle to the same producers and sessions.
pub struct Aggregator<R, T> {
    inner: Arc<Inner<R, T>>,
}

impl<R, T> Clone for Aggregator<R, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, T> std::fmt::Debug for Aggregator<R, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .field("bus", &self.inner.bus)
            .finish()
    }
}

impl<R, T> Default for Aggregator<R, T>
where
    R: Clone + Send + Sync + 'static,
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl<R, T> Aggregator<R, T>
where
    R: Clone + Send + Sync + 'static,
    T: Send + 'static,
{
    /// Create a new [`Aggregator`] with no producers.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let bus = Bus::new();
        let registry = Registry::new(&bus);
        Self {
            inner: Arc::new(Inner {
                config,
                membership: Mutex::new(()),
                bus,
                registry,
            }),
        }
    }

    /// Register `producer` under `key`.
    ///
    /// Every open session starts a task for the producer before this
    /// function returns, and later sessions start one from the registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyKey`] if `key` is empty and
    /// [`Error::DuplicateKey`] if `key` is registered and
    /// [`Config::reject_duplicate_keys`] is set.
    pub fn add_producer<K, P>(&self, key: K, producer: P) -> Result<(), Error>
    where
        K: Into<String>,
        P: Producer<R, T> + 'static,
    {
        self.add_shared(key, Arc::new(producer))
    }

    /// Register an already shared `producer` under `key`. See
    /// [`Aggregator::add_producer`].
    ///
    /// # Errors
    ///
    /// See [`Aggregator::add_producer`].
    pub fn add_shared<K>(&self, key: K, producer: Arc<dyn Producer<R, T>>) -> Result<(), Error>
    where
        K: Into<String>,
    {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }

        let _membership = self.inner.lock();
        if self.inner.registry.contains(&key) {
            if self.inner.config.reject_duplicate_keys {
                return Err(Error::DuplicateKey(key));
            }
            debug!(key = %key, "replacing producer registered under existing key");
        }

        debug!(key = %key, "adding producer");
        counter!("producers_added").increment(1);
        self.inner
            .bus
            .publish(&Notification::Added { key, producer });
        Ok(())
    }

    /// Remove the producer registered under `key`, cancelling its task in
    /// every open session. Removing an unknown key does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyKey`] if `key` is empty.
    pub fn remove_producer(&self, key: &str) -> Result<(), Error> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }

        let _membership = self.inner.lock();
        debug!(key = %key, "removing producer");
        counter!("producers_removed").increment(1);
        self.inner.bus.publish(&Notification::Removed {
            key: key.to_string(),
        });
        Ok(())
    }

    /// Keys of every registered producer, in no particular order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner.registry.keys()
    }

    /// Whether a producer is registered under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.registry.contains(key)
    }

    /// Number of registered producers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether no producer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start consuming from every producer, present and future.
    ///
    /// Each registered producer immediately gets a task writing into the
    /// returned session, and each producer added later gets one too for as
    /// long as the session is open. When `shutdown` is cancelled, or the
    /// session is dropped, every task of this session is cancelled and the
    /// output channel closes once all of them have returned. Calling this
    /// with an already cancelled `shutdown` yields a session that closes
    /// immediately without producing anything.
    ///
    /// Producer tasks run on the tokio runtime of the caller. Outside of a
    /// runtime there is nowhere to run them and the returned session is
    /// already closed.
    pub fn consume(
        &self,
        shutdown: &CancellationToken,
        request: R,
        options: ConsumeOptions,
    ) -> Session<T> {
        let Ok(runtime) = Handle::try_current() else {
            warn!("consume called outside of a tokio runtime, session is closed");
            return Session::closed_from_start();
        };
        let (output, receiver) = flume::bounded(options.channel_length);
        let (state_snd, state_rcv) = watch::channel(State::Open);
        let tracker = TaskTracker::new();
        let session_shutdown = shutdown.child_token();

        let core = Arc::new(SessionCore {
            request,
            output,
            shutdown: session_shutdown.clone(),
            tracker: tracker.clone(),
            runtime: runtime.clone(),
            bus: self.inner.bus.clone(),
        });

        let on_added = {
            let _membership = self.inner.lock();
            for (key, producer) in self.inner.registry.snapshot() {
                core.start(&key, producer);
            }

            let core = Arc::clone(&core);
            self.inner
                .bus
                .subscribe(Filter::added(), move |notification| {
                    if let Notification::Added { key, producer } = notification {
                        core.start(key, Arc::clone(producer));
                    }
                })
        };
        // From here on the session's sender lives only in the subscription.
        drop(core);

        gauge!("sessions_open").increment(1.0);
        info!(producers = tracker.len(), "session open");

        let inner = Arc::clone(&self.inner);
        let drain_tracker = tracker.clone();
        let drain_shutdown = session_shutdown.clone();
        runtime.spawn(async move {
            drain_shutdown.cancelled().await;
            state_snd.send_replace(State::Draining);
            info!(
                producers = drain_tracker.len(),
                "session draining, waiting on producer tasks"
            );

            {
                // Under the membership lock no add can be mid-way through
                // starting a task for this session. Once unsubscribed none
                // ever will be.
                let _membership = inner.lock();
                on_added.unsubscribe();
            }
            drain_tracker.close();
            drain_tracker.wait().await;

            state_snd.send_replace(State::Closed);
            gauge!("sessions_open").decrement(1.0);
            info!("session closed");
        });

        Session::new(receiver, state_rcv, tracker, session_shutdown.drop_guard())
    }
}

/// Everything a session needs to start producer tasks.
struct SessionCore<R, T> {
    request: R,
    output: Output<T>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    runtime: Handle,
    bus: Bus<SharedProducer<R, T>>,
}

impl<R, T> SessionCore<R, T>
where
    R: Clone + Send + Sync + 'static,
    T: Send + 'static,
{
    /// Spawn a task running `producer` for this session.
    ///
    /// Must be called with the membership lock held.
    fn start(&self, key: &str, producer: SharedProducer<R, T>) {
        if self.shutdown.is_cancelled() {
            // Added just as the session ended. Skipping is fine, nobody is
            // listening anymore.
            debug!(key = %key, "session is draining, not starting producer");
            return;
        }

        let shutdown = self.shutdown.child_token();
        let on_removed = {
            let shutdown = shutdown.clone();
            self.bus
                .subscribe(Filter::removed().with_key(key), move |_| shutdown.cancel())
        };

        let request = self.request.clone();
        let output = self.output.clone();
        let key = key.to_string();
        counter!("producer_tasks_started").increment(1);
        self.tracker.spawn_on(
            async move {
                debug!(key = %key, "producer task started");
                producer.produce(request, output, shutdown).await;
                on_removed.unsubscribe();
                counter!("producer_tasks_finished").increment(1);
                debug!(key = %key, "producer task finished");
            },
            &self.runtime,
        );
    }
}
