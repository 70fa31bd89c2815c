//! A single consumption session.
//!
//! A [`Session`] is returned by [`crate::Aggregator::consume`]. It owns the
//! receive half of the session's output channel and reports the session's
//! lifecycle:
//!
//! ```text
//! Open --(shutdown cancelled)--> Draining --(last producer task exits)--> Closed
//! ```
//!
//! There is no way back from `Closed`. Once the session is `Closed` no
//! producer task remains that could write into the channel, and `recv` yields
//! `None` after the buffered values are drained.

use flume::TryRecvError;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::{
    sync::{CancellationToken, DropGuard},
    task::TaskTracker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle of a [`Session`].
pub enum State {
    /// New producer tasks are started as producers are added.
    Open,
    /// Shutdown was requested. No new tasks start, running ones are finishing.
    Draining,
    /// Every producer task has exited and the output channel is closed.
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
/// Per-session options for [`crate::Aggregator::consume`].
pub struct ConsumeOptions {
    /// Buffer length of the output channel. Zero, the default, is a
    /// hand-off: every send waits until the consumer receives the value.
    #[serde(default)]
    pub channel_length: usize,
}

impl ConsumeOptions {
    /// Set the output channel buffer length.
    #[must_use]
    pub fn channel_length(mut self, length: usize) -> Self {
        self.channel_length = length;
        self
    }
}

/// The consumer end of one [`crate::Aggregator::consume`] call.
///
/// Dropping a `Session` cancels it: every producer task started for it is
/// told to stop.
#[derive(Debug)]
pub struct Session<T> {
    receiver: flume::Receiver<T>,
    state: watch::Receiver<State>,
    tracker: TaskTracker,
    _cancel_on_drop: DropGuard,
}

impl<T> Session<T> {
    pub(crate) fn new(
        receiver: flume::Receiver<T>,
        state: watch::Receiver<State>,
        tracker: TaskTracker,
        cancel_on_drop: DropGuard,
    ) -> Self {
        Self {
            receiver,
            state,
            tracker,
            _cancel_on_drop: cancel_on_drop,
        }
    }

    /// A session that never opened: no producers, no values, `Closed`.
    pub(crate) fn closed_from_start() -> Self {
        let (_, receiver) = flume::bounded(0);
        let (_, state) = watch::channel(State::Closed);
        let tracker = TaskTracker::new();
        tracker.close();
        Self::new(receiver, state, tracker, CancellationToken::new().drop_guard())
    }

    /// Receive the next value from any producer.
    ///
    /// Returns `None` once the session is closed and every buffered value has
    /// been received. Values from distinct producers interleave arbitrarily;
    /// values from one producer arrive in the order it sent them.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv_async().await.ok()
    }

    /// Receive a value if one is immediately available.
    ///
    /// # Errors
    ///
    /// Returns [`TryRecvError::Empty`] if no value is ready and
    /// [`TryRecvError::Disconnected`] once the channel is closed and empty.
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        self.receiver.try_recv()
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Wait until the session reaches [`State::Closed`].
    ///
    /// This does not receive values. With a small channel and producers
    /// still blocked on send, call this only after shutdown has been
    /// requested and while something else drains the channel, or after the
    /// channel is drained.
    pub async fn closed(&mut self) {
        // An error means the drain task is gone, which only happens once it
        // has published `Closed` or the runtime is shutting down.
        let _ = self.state.wait_for(|state| *state == State::Closed).await;
    }

    /// Number of producer tasks currently running for this session.
    #[must_use]
    pub fn live_tasks(&self) -> usize {
        self.tracker.len()
    }
}
