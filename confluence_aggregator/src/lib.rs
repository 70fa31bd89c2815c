//! Fan-in of a changing set of producers into cancellable consumer sessions.
//!
//! An [`Aggregator`] holds producers registered under string keys. Each call
//! to [`Aggregator::consume`] opens a [`Session`]: every registered producer
//! gets its own task writing into the session's output channel, producers
//! added while the session is open join it, and removing a producer cancels
//! exactly its own tasks. Cancelling the session's shutdown token stops every
//! task of the session; the output channel closes only after the last of
//! them has returned.
//!
//! Membership changes travel over a small internal notification bus. The
//! registry and every open session subscribe to it, so a session never has
//! to poll for producers and the registry never needs to be written to
//! directly.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

mod aggregator;
mod bus;
mod producer;
mod registry;
mod session;

pub use aggregator::{Aggregator, Config, Error};
pub use producer::{Output, Producer, ProducerFn};
pub use session::{ConsumeOptions, Session, State};
