//! The producer capability.
//!
//! A producer is anything that, given a request and an output channel, writes
//! values into that channel until told to stop. Producers have no identity of
//! their own; the aggregator knows them only by the key they were registered
//! under.

use std::{fmt, future::Future};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// The write half of a session's output channel.
///
/// With a zero channel length a send completes only once the consumer has
/// taken the value. A send future dropped before then withdraws its value.
pub type Output<T> = flume::Sender<T>;

#[async_trait]
/// Produces values for a consumer session.
///
/// `produce` is called once per session the producer participates in. It
/// must write available data into `output` until `shutdown` is cancelled and
/// then return. It must do its own retry and backoff: the aggregator does
/// not interpret a return as failure and will not restart it. A send error
/// on `output` means the consumer is gone and the producer should return.
pub trait Producer<R, T>: Send + Sync {
    /// Write values into `output` until `shutdown` fires.
    async fn produce(&self, request: R, output: Output<T>, shutdown: CancellationToken);
}

/// Adapter allowing an ordinary async closure to be used as a [`Producer`].
#[derive(Clone, Copy)]
pub struct ProducerFn<F>(pub F);

impl<F> fmt::Debug for ProducerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProducerFn")
    }
}

#[async_trait]
impl<R, T, F, Fut> Producer<R, T> for ProducerFn<F>
where
    R: Send + 'static,
    T: Send + 'static,
    F: Fn(R, Output<T>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn produce(&self, request: R, output: Output<T>, shutdown: CancellationToken) {
        (self.0)(request, output, shutdown).await;
    }
}
