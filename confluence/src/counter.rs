//! The counting consumer.
//!
//! Drains a session of [`Envelope`]s and keeps per-source totals. Sequence
//! numbers are checked as they arrive: an emitter numbers its envelopes from
//! zero for every session it joins, so any envelope that is neither the
//! successor of the previous one from its source nor a fresh zero is
//! counted as out of order.
//!
//! ## Metrics
//!
//! `envelopes_received`: Envelopes received, labelled by `source_id`
//! `envelopes_out_of_order`: Envelopes breaking their source's sequence
//!

use std::{collections::BTreeMap, time::Duration};

use confluence_aggregator::Session;
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::time::{self, MissedTickBehavior};
use tracing::info;

use crate::emitter::Envelope;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Totals gathered from one session.
pub struct Counts {
    by_source: BTreeMap<String, u64>,
    out_of_order: u64,
}

impl Counts {
    /// Total envelopes received.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.by_source.values().sum()
    }

    /// Envelopes received from `source_id`.
    #[must_use]
    pub fn get(&self, source_id: &str) -> u64 {
        self.by_source.get(source_id).copied().unwrap_or(0)
    }

    /// Per-source totals, ordered by source id.
    #[must_use]
    pub fn by_source(&self) -> &BTreeMap<String, u64> {
        &self.by_source
    }

    /// Envelopes whose sequence number did not follow their source's
    /// previous envelope.
    #[must_use]
    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }
}

#[derive(Debug, Default)]
/// Accumulates [`Counts`] one envelope at a time.
pub struct Counter {
    counts: Counts,
    last_sequence: FxHashMap<String, u64>,
}

impl Counter {
    /// Record `envelope`.
    pub fn observe(&mut self, envelope: &Envelope) {
        counter!("envelopes_received", "source_id" => envelope.source_id.clone()).increment(1);
        *self
            .counts
            .by_source
            .entry(envelope.source_id.clone())
            .or_default() += 1;

        let previous = self
            .last_sequence
            .insert(envelope.source_id.clone(), envelope.sequence);
        let in_order = match previous {
            None => envelope.sequence == 0,
            Some(previous) => {
                envelope.sequence == 0 || previous.checked_add(1) == Some(envelope.sequence)
            }
        };
        if !in_order {
            counter!("envelopes_out_of_order").increment(1);
            self.counts.out_of_order += 1;
        }
    }

    /// The totals so far.
    #[must_use]
    pub fn counts(&self) -> &Counts {
        &self.counts
    }

    /// Consume the counter, returning its totals.
    #[must_use]
    pub fn finish(self) -> Counts {
        self.counts
    }
}

/// Receive from `session` until it closes and return what arrived.
///
/// When `report_interval` is given the running totals are logged on that
/// period.
pub async fn count(session: &mut Session<Envelope>, report_interval: Option<Duration>) -> Counts {
    let mut counter = Counter::default();
    let Some(period) = report_interval else {
        while let Some(envelope) = session.recv().await {
            counter.observe(&envelope);
        }
        return counter.finish();
    };

    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            envelope = session.recv() => match envelope {
                Some(envelope) => counter.observe(&envelope),
                None => break,
            },
            _ = interval.tick() => {
                let counts = counter.counts();
                info!(
                    total = counts.total(),
                    sources = counts.by_source().len(),
                    out_of_order = counts.out_of_order(),
                    "envelopes received"
                );
            }
        }
    }
    counter.finish()
}
