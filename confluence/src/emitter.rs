//! The synthetic envelope producer.
//!
//! An [`Emitter`] stands in for one upstream source. For every session it
//! joins it writes envelopes for its source id at a fixed rate, numbering
//! them from zero so a consumer can check per-source ordering. The payload is
//! built once from a seeded RNG when the emitter is created and reused for
//! every envelope.
//!
//! ## Metrics
//!
//! `envelopes_sent`: Envelopes accepted by the session channel
//! `envelope_send_failure`: Sends that found the session channel closed
//!
//! Both are labelled with `source_id` and `shard_id`.
//!

use std::{
    num::NonZeroU32,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use confluence_aggregator::{Output, Producer};
use metrics::counter;
use rand::{Rng, SeedableRng, distr::Alphanumeric, rngs::StdRng};
use serde::{Deserialize, Serialize};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::manager::ProducerFactory;

/// `tokio::time::interval` rejects a zero period.
const MIN_PERIOD: Duration = Duration::from_nanos(1);

fn default_payload_bytes() -> usize {
    64
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Emitter`]
pub struct Config {
    /// The seed for the payload RNG
    #[serde(default)]
    pub seed: [u8; 32],
    /// Envelopes written per second by each emitter in each session. Rates
    /// above one billion are capped at one envelope per nanosecond.
    pub envelopes_per_second: NonZeroU32,
    /// Length of the ASCII payload carried by each envelope
    #[serde(default = "default_payload_bytes")]
    pub payload_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One unit of data written by an [`Emitter`].
pub struct Envelope {
    /// The source this envelope came from.
    pub source_id: String,
    /// Position of this envelope in its emitter's output for one session,
    /// starting at zero.
    pub sequence: u64,
    /// Wall clock time of creation, nanoseconds since the Unix epoch.
    pub timestamp_nanos: u64,
    /// Filler.
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The request every emitter receives when a session starts.
pub struct Request {
    /// Name of the consuming shard, used to label metrics.
    pub shard_id: String,
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| u64::try_from(since.as_nanos()).unwrap_or(u64::MAX))
}

#[derive(Debug)]
/// Writes envelopes for a single source id.
pub struct Emitter {
    source_id: String,
    period: Duration,
    payload: String,
}

impl Emitter {
    /// Create a new [`Emitter`] for `source_id`.
    #[must_use]
    pub fn new(source_id: &str, config: &Config) -> Self {
        let rng = StdRng::from_seed(config.seed);
        let payload: String = rng
            .sample_iter(Alphanumeric)
            .take(config.payload_bytes)
            .map(char::from)
            .collect();
        Self {
            source_id: source_id.to_string(),
            period: (Duration::from_secs(1) / config.envelopes_per_second.get())
                .max(MIN_PERIOD),
            payload,
        }
    }

    fn envelope(&self, sequence: u64) -> Envelope {
        Envelope {
            source_id: self.source_id.clone(),
            sequence,
            timestamp_nanos: now_nanos(),
            payload: self.payload.clone(),
        }
    }
}

#[async_trait]
impl Producer<Request, Envelope> for Emitter {
    async fn produce(
        &self,
        request: Request,
        output: Output<Envelope>,
        shutdown: CancellationToken,
    ) {
        let labels = vec![
            ("source_id".to_string(), self.source_id.clone()),
            ("shard_id".to_string(), request.shard_id),
        ];
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sequence: u64 = 0;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!(source_id = %self.source_id, sequence, "emitter shutdown");
                    return;
                }
                _ = interval.tick() => {
                    let envelope = self.envelope(sequence);
                    tokio::select! {
                        () = shutdown.cancelled() => {
                            debug!(source_id = %self.source_id, sequence, "emitter shutdown while blocked");
                            return;
                        }
                        res = output.send_async(envelope) => {
                            if res.is_err() {
                                counter!("envelope_send_failure", &labels).increment(1);
                                debug!(source_id = %self.source_id, "session channel closed");
                                return;
                            }
                            counter!("envelopes_sent", &labels).increment(1);
                            sequence += 1;
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
/// Builds an [`Emitter`] per source id from one shared [`Config`].
pub struct EmitterFactory {
    config: Config,
}

impl EmitterFactory {
    /// Create a new [`EmitterFactory`].
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ProducerFactory<Request, Envelope> for EmitterFactory {
    fn producer(&self, source_id: &str) -> Arc<dyn Producer<Request, Envelope>> {
        Arc::new(Emitter::new(source_id, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            seed: [7; 32],
            envelopes_per_second: NonZeroU32::new(1_000).expect("non-zero"),
            payload_bytes: 16,
        }
    }

    fn request() -> Request {
        Request {
            shard_id: "test".to_string(),
        }
    }

    #[test]
    fn payload_is_seeded() {
        let a = Emitter::new("a", &config());
        let b = Emitter::new("b", &config());
        assert_eq!(a.payload.len(), 16);
        assert!(a.payload.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(a.payload, b.payload);
        assert_eq!(a.period, Duration::from_millis(1));
    }

    #[tokio::test]
    async fn sequence_starts_at_zero_and_stops_on_cancel() {
        let emitter = Emitter::new("a", &config());
        let (snd, rcv) = flume::bounded(1);
        let shutdown = CancellationToken::new();

        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { emitter.produce(request(), snd, shutdown).await })
        };

        for expected in 0..5 {
            let envelope = rcv.recv_async().await.expect("emitter running");
            assert_eq!(envelope.source_id, "a");
            assert_eq!(envelope.sequence, expected);
        }
        shutdown.cancel();
        task.await.expect("emitter panicked");

        while let Ok(envelope) = rcv.recv_async().await {
            assert!(envelope.sequence >= 5);
        }
    }

    #[tokio::test]
    async fn stops_when_channel_closes() {
        let emitter = Emitter::new("a", &config());
        let (snd, rcv) = flume::bounded(1);
        drop(rcv);
        // Never cancelled; the closed channel alone must end the task.
        emitter
            .produce(request(), snd, CancellationToken::new())
            .await;
    }

    #[tokio::test]
    async fn rates_beyond_nanosecond_resolution_still_emit() {
        let config = Config {
            envelopes_per_second: NonZeroU32::new(u32::MAX).expect("non-zero"),
            ..config()
        };
        let emitter = Emitter::new("a", &config);
        assert_eq!(emitter.period, MIN_PERIOD);

        let (snd, rcv) = flume::bounded(0);
        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { emitter.produce(request(), snd, shutdown).await })
        };
        for expected in 0..3 {
            let envelope = rcv.recv_async().await.expect("emitter running");
            assert_eq!(envelope.sequence, expected);
        }
        shutdown.cancel();
        task.await.expect("emitter panicked");
    }

    #[test]
    fn envelope_serializes() {
        let envelope = Envelope {
            source_id: "a".to_string(),
            sequence: 3,
            timestamp_nanos: 10,
            payload: "xyz".to_string(),
        };
        let json = serde_json::to_string(&envelope).expect("serializable");
        assert_eq!(
            json,
            r#"{"source_id":"a","sequence":3,"timestamp_nanos":10,"payload":"xyz"}"#
        );
    }
}
