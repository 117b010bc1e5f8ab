//! Collector counters and the periodic stats line

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::ingestion::IngestionHandle;

#[derive(Debug, Default)]
pub struct IngestionStats {
    pub ticks_received: AtomicU64,
    pub closed_bars: AtomicU64,
    pub publish_failures: AtomicU64,
    pub cache_failures: AtomicU64,
    /// Bars dropped for breaking OHLC invariants.
    pub invalid_bars: AtomicU64,
    /// History loads that failed while opening a stream.
    pub warmup_failures: AtomicU64,
    pub connects: AtomicU64,
    pub reconnects: AtomicU64,
    pub commands_applied: AtomicU64,
    pub commands_stale: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub ticks_received: u64,
    pub closed_bars: u64,
    pub publish_failures: u64,
    pub cache_failures: u64,
    pub invalid_bars: u64,
    pub warmup_failures: u64,
    pub connects: u64,
    pub reconnects: u64,
    pub commands_applied: u64,
    pub commands_stale: u64,
}

impl IngestionStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks_received: self.ticks_received.load(Ordering::Relaxed),
            closed_bars: self.closed_bars.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            cache_failures: self.cache_failures.load(Ordering::Relaxed),
            invalid_bars: self.invalid_bars.load(Ordering::Relaxed),
            warmup_failures: self.warmup_failures.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            commands_applied: self.commands_applied.load(Ordering::Relaxed),
            commands_stale: self.commands_stale.load(Ordering::Relaxed),
        }
    }
}

/// Log active streams and counters every `interval` until shutdown.
pub async fn run_stats_logger(
    ingestion: IngestionHandle,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let snapshot = match ingestion.snapshot().await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!(error = %e, "Stats unavailable");
                        break;
                    }
                };
                let counters = ingestion.stats().snapshot();
                let streams: Vec<String> = snapshot
                    .streams
                    .iter()
                    .map(|s| format!("{}={}({})", s.key, s.state, s.demand))
                    .collect();
                info!(
                    active_streams = snapshot.streams.len(),
                    live_connections = snapshot.live_connections,
                    pending_reconnects = snapshot.pending_reconnects,
                    ticks = counters.ticks_received,
                    closed_bars = counters.closed_bars,
                    publish_failures = counters.publish_failures,
                    invalid_bars = counters.invalid_bars,
                    reconnects = counters.reconnects,
                    streams = %streams.join(","),
                    "Collector stats"
                );
            }
        }
    }
}
