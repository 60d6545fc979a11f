//! The emission loop.
//!
//! Once per [`TICK`] the [`Emitter`] produces `max(1, rate / payload_size)`
//! records of random bytes and writes them to its [`Sink`]. Time spent
//! writing inside a tick is not accounted for, a tick's records land in a
//! burst and a slow sink falls behind. Missed ticks are skipped, not
//! replayed.
//!
//! Write failures do not stop the loop. Each is logged and counted in the
//! registry's write failure counter, and the loop moves on to the next
//! record.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use rand::{RngCore, SeedableRng, rngs::StdRng};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{config::Config, signal, sink::Sink, telemetry::Registry};

/// Interval between emission bursts.
pub const TICK: Duration = Duration::from_secs(1);

/// Records emitted per tick for the given rate and payload size.
#[must_use]
pub fn records_per_tick(bytes_per_second: u64, payload_size: NonZeroUsize) -> u64 {
    (bytes_per_second / payload_size.get() as u64).max(1)
}

/// Totals produced by one [`Emitter::spin`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    /// Ticks that fired.
    pub ticks: u64,
    /// Records produced.
    pub records: u64,
    /// Bytes produced.
    pub bytes: u64,
}

#[derive(Debug)]
/// Paced producer of random payloads.
pub struct Emitter {
    payload: Vec<u8>,
    records_per_tick: u64,
    duration: Option<Duration>,
    rng: StdRng,
    registry: Arc<Registry>,
    shutdown: signal::Watcher,
}

impl Emitter {
    /// Create a new [`Emitter`] for `config`.
    #[must_use]
    pub fn new(config: &Config, registry: Arc<Registry>, shutdown: signal::Watcher) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };

        Self {
            payload: vec![0; config.payload_size.get()],
            records_per_tick: records_per_tick(config.bytes_per_second, config.payload_size),
            duration: config.duration,
            rng,
            registry,
            shutdown,
        }
    }

    /// Produce one tick's worth of records into `sink`, returning the number
    /// of records produced.
    pub async fn tick(&mut self, sink: &mut Sink) -> u64 {
        let bytes = self.payload.len() as u64;
        for _ in 0..self.records_per_tick {
            self.rng.fill_bytes(&mut self.payload);

            if let Err(err) = sink.write_payload(&self.payload).await {
                warn!("payload write failed: {err}");
                self.registry.write_failed();
            }
            if let Err(err) = sink.audit(self.payload.len()).await {
                warn!("audit write failed: {err}");
                self.registry.write_failed();
            }
            self.registry.produced(bytes, 1);
        }
        if let Err(err) = sink.flush().await {
            warn!("sink flush failed: {err}");
            self.registry.write_failed();
        }
        self.records_per_tick
    }

    /// Run [`Emitter`] until the shutdown signal is received or the
    /// configured duration has elapsed.
    ///
    /// Both conditions are only observed between ticks.
    pub async fn spin(mut self, sink: &mut Sink) -> Summary {
        info!(
            records_per_tick = self.records_per_tick,
            payload_size = self.payload.len(),
            "emitter running"
        );

        let start = Instant::now();
        let mut interval = time::interval_at(start + TICK, TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let shutdown_wait = self.shutdown.clone().recv();
        tokio::pin!(shutdown_wait);

        let mut summary = Summary::default();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let records = self.tick(sink).await;
                    summary.ticks += 1;
                    summary.records += records;
                    summary.bytes += records * self.payload.len() as u64;
                    debug!(tick = summary.ticks, records, "tick complete");
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return summary;
                }
            }

            if let Some(duration) = self.duration.filter(|d| start.elapsed() >= *d) {
                info!("run duration of {duration:?} elapsed");
                return summary;
            }
        }
    }
}
