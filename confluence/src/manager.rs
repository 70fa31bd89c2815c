//! Keeps aggregator membership in line with a source provider.
//!
//! ## Metrics
//!
//! `reconcile_runs`: Reconcile passes attempted
//! `reconcile_failures`: Reconcile passes that returned an error
//! `reconcile_added`: Producers added by reconciling
//! `reconcile_removed`: Producers removed by reconciling
//! `reconcile_desired_sources`: Distinct source ids wanted by the last pass
//!

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use confluence_aggregator::{Aggregator, Producer};
use metrics::{counter, gauge};
use rustc_hash::FxHashSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::source::SourceProvider;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`SourceManager`].
pub enum Error {
    /// The aggregator refused a membership change.
    #[error(transparent)]
    Aggregator(#[from] confluence_aggregator::Error),
}

/// Builds the producer for a newly wanted source id.
pub trait ProducerFactory<R, T>: Send + Sync {
    /// A producer for `source_id`.
    fn producer(&self, source_id: &str) -> Arc<dyn Producer<R, T>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// The membership changes made by one [`SourceManager::reconcile`] pass.
pub struct Reconciliation {
    /// Source ids registered by this pass, sorted.
    pub added: Vec<String>,
    /// Source ids removed by this pass, sorted.
    pub removed: Vec<String>,
}

impl Reconciliation {
    /// Whether the pass changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Periodically reconciles an [`Aggregator`] against a [`SourceProvider`].
///
/// The manager assumes it owns the aggregator's membership: any registered
/// key the provider no longer reports is removed, whoever added it.
pub struct SourceManager<S, F, R, T> {
    provider: S,
    factory: F,
    aggregator: Aggregator<R, T>,
    update_interval: Duration,
}

impl<S, F, R, T> std::fmt::Debug for SourceManager<S, F, R, T>
where
    S: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceManager")
            .field("provider", &self.provider)
            .field("aggregator", &self.aggregator)
            .field("update_interval", &self.update_interval)
            .finish_non_exhaustive()
    }
}

impl<S, F, R, T> SourceManager<S, F, R, T>
where
    S: SourceProvider,
    F: ProducerFactory<R, T>,
    R: Clone + Send + Sync + 'static,
    T: Send + 'static,
{
    /// Create a new [`SourceManager`].
    pub fn new(
        provider: S,
        factory: F,
        aggregator: Aggregator<R, T>,
        update_interval: Duration,
    ) -> Self {
        Self {
            provider,
            factory,
            aggregator,
            update_interval,
        }
    }

    /// Ask the provider for the wanted source ids once and add or remove
    /// producers to match. Duplicate and empty ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the aggregator rejects a change, which happens
    /// only when it rejects duplicate keys and another caller registered a
    /// wanted id concurrently. Changes made before the error stay in place.
    pub async fn reconcile(&self) -> Result<Reconciliation, Error> {
        counter!("reconcile_runs").increment(1);

        let desired: BTreeSet<String> = self
            .provider
            .source_ids()
            .await
            .into_iter()
            .filter(|id| !id.is_empty())
            .collect();
        gauge!("reconcile_desired_sources").set(desired.len() as f64);

        let current: FxHashSet<String> = self.aggregator.keys().into_iter().collect();
        let mut removed: Vec<String> = current
            .iter()
            .filter(|id| !desired.contains(*id))
            .cloned()
            .collect();
        removed.sort_unstable();
        let added: Vec<String> = desired
            .into_iter()
            .filter(|id| !current.contains(id))
            .collect();

        let res = self.apply(&added, &removed);
        if res.is_err() {
            counter!("reconcile_failures").increment(1);
        }
        res?;

        counter!("reconcile_added").increment(added.len() as u64);
        counter!("reconcile_removed").increment(removed.len() as u64);
        Ok(Reconciliation { added, removed })
    }

    fn apply(&self, added: &[String], removed: &[String]) -> Result<(), Error> {
        for id in removed {
            debug!(source_id = %id, "source no longer wanted");
            self.aggregator.remove_producer(id)?;
        }
        for id in added {
            debug!(source_id = %id, "source wanted");
            self.aggregator
                .add_shared(id.clone(), self.factory.producer(id))?;
        }
        Ok(())
    }

    /// Reconcile every `update_interval`, starting immediately, until
    /// `shutdown` is cancelled. Failed passes are logged and retried on the
    /// next tick.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = time::interval(self.update_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("source manager shutting down");
                    return;
                }
                _ = interval.tick() => {
                    match self.reconcile().await {
                        Ok(summary) if summary.is_empty() => {}
                        Ok(summary) => info!(
                            added = summary.added.len(),
                            removed = summary.removed.len(),
                            total = self.aggregator.len(),
                            "sources reconciled"
                        ),
                        Err(err) => warn!("failed to reconcile sources: {err}"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use confluence_aggregator::{Config, Output, ProducerFn};
    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Default)]
    struct Scripted {
        ids: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn set(&self, ids: &[&str]) {
            *self.ids.lock().expect("lock poisoned") = ids.iter().map(ToString::to_string).collect();
        }
    }

    #[async_trait]
    impl SourceProvider for Arc<Scripted> {
        async fn source_ids(&self) -> Vec<String> {
            self.ids.lock().expect("lock poisoned").clone()
        }
    }

    struct Idle;

    impl ProducerFactory<(), u64> for Idle {
        fn producer(&self, _source_id: &str) -> Arc<dyn Producer<(), u64>> {
            Arc::new(ProducerFn(
                |_request: (), _output: Output<u64>, shutdown: CancellationToken| async move {
                    shutdown.cancelled().await;
                },
            ))
        }
    }

    fn manager(
        provider: Arc<Scripted>,
        aggregator: &Aggregator<(), u64>,
    ) -> SourceManager<Arc<Scripted>, Idle, (), u64> {
        SourceManager::new(provider, Idle, aggregator.clone(), Duration::from_millis(10))
    }

    fn sorted(mut keys: Vec<String>) -> Vec<String> {
        keys.sort_unstable();
        keys
    }

    #[tokio::test]
    async fn reconcile_adds_and_removes() {
        let provider = Arc::new(Scripted::default());
        let aggregator = Aggregator::default();
        let manager = manager(Arc::clone(&provider), &aggregator);

        provider.set(&["b", "a", "a", ""]);
        let summary = manager.reconcile().await.expect("reconcile");
        assert_eq!(summary.added, vec!["a", "b"]);
        assert!(summary.removed.is_empty());
        assert_eq!(sorted(aggregator.keys()), vec!["a", "b"]);

        provider.set(&["b", "c"]);
        let summary = manager.reconcile().await.expect("reconcile");
        assert_eq!(summary.added, vec!["c"]);
        assert_eq!(summary.removed, vec!["a"]);
        assert_eq!(sorted(aggregator.keys()), vec!["b", "c"]);

        let summary = manager.reconcile().await.expect("reconcile");
        assert!(summary.is_empty());
    }

    #[tokio::test]
    async fn shared_aggregator_is_not_registered_twice() {
        let provider = Arc::new(Scripted::default());
        let aggregator = Aggregator::new(Config {
            reject_duplicate_keys: true,
        });
        let manager = manager(Arc::clone(&provider), &aggregator);

        provider.set(&["a"]);
        manager.reconcile().await.expect("reconcile");
        // A second manager sharing the aggregator sees "a" as registered and
        // leaves it alone.
        let other = SourceManager::new(
            Arc::clone(&provider),
            Idle,
            aggregator.clone(),
            Duration::from_secs(1),
        );
        assert!(other.reconcile().await.expect("reconcile").is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let provider = Arc::new(Scripted::default());
        provider.set(&["a"]);
        let aggregator = Aggregator::default();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(manager(provider, &aggregator).run(shutdown.clone()));
        while !aggregator.contains("a") {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        shutdown.cancel();
        handle.await.expect("manager task panicked");
    }

    proptest! {
        #[test]
        fn reconcile_converges(rounds in prop::collection::vec(
            prop::collection::vec("[a-e]{0,2}", 0..8),
            1..6,
        )) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");
            runtime.block_on(async {
                let provider = Arc::new(Scripted::default());
                let aggregator = Aggregator::default();
                let manager = manager(Arc::clone(&provider), &aggregator);

                for ids in rounds {
                    let borrowed: Vec<&str> = ids.iter().map(String::as_str).collect();
                    provider.set(&borrowed);
                    manager.reconcile().await.expect("reconcile");

                    let expected: BTreeSet<String> =
                        ids.into_iter().filter(|id| !id.is_empty()).collect();
                    let expected: Vec<String> = expected.into_iter().collect();
                    assert_eq!(sorted(aggregator.keys()), expected);
                }
            });
        }
    }
}
