//! The confluence load harness.
//!
//! This library supports the confluence binary found elsewhere in this
//! project. It keeps a [`confluence_aggregator::Aggregator`] populated with
//! one synthetic producer per live source id, as reported by a configurable
//! source provider, and counts what arrives on the aggregated stream.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod counter;
pub mod emitter;
pub mod manager;
pub mod source;
