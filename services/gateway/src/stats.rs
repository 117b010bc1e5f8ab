//! Gateway counters, the health snapshot and the periodic stats line

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::delivery::GatewayHandle;

#[derive(Debug, Default)]
pub struct GatewayStats {
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub lagging_disconnects: AtomicU64,
    pub ticks_received: AtomicU64,
    pub messages_delivered: AtomicU64,
    pub snapshots_served: AtomicU64,
    pub snapshot_failures: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub rate_limited: AtomicU64,
    /// Resyncs triggered by collector announcements or a regained presence
    /// subscription.
    pub resyncs: AtomicU64,
    /// A tick subscription is currently live.
    pub tick_stream_connected: AtomicBool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub lagging_disconnects: u64,
    pub ticks_received: u64,
    pub messages_delivered: u64,
    pub snapshots_served: u64,
    pub snapshot_failures: u64,
    pub protocol_errors: u64,
    pub rate_limited: u64,
    pub resyncs: u64,
}

impl GatewayStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_tick_stream(&self, connected: bool) {
        self.tick_stream_connected.store(connected, Ordering::Relaxed);
    }

    pub fn tick_stream(&self) -> bool {
        self.tick_stream_connected.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            lagging_disconnects: self.lagging_disconnects.load(Ordering::Relaxed),
            ticks_received: self.ticks_received.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            snapshots_served: self.snapshots_served.load(Ordering::Relaxed),
            snapshot_failures: self.snapshot_failures.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionCount {
    /// `{instrument}:{interval}`
    pub subscription: String,
    pub count: usize,
}

/// Point-in-time view of sessions and demand, as served on the health
/// endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySnapshot {
    pub total_clients: usize,
    /// Sum of every session's subscription set.
    pub active_subscriptions: usize,
    /// StreamKeys with at least one subscriber.
    pub total_subscription_groups: usize,
    pub subscription_counts: Vec<SubscriptionCount>,
}

impl GatewaySnapshot {
    pub fn count_of(&self, subscription: &str) -> usize {
        self.subscription_counts
            .iter()
            .find(|c| c.subscription == subscription)
            .map_or(0, |c| c.count)
    }
}

/// Log sessions and active streams every `interval` while any client is
/// connected.
pub async fn run_stats_logger(
    gateway: GatewayHandle,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let snapshot = match gateway.snapshot().await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!(error = %e, "Stats unavailable");
                        break;
                    }
                };
                if snapshot.total_clients == 0 {
                    continue;
                }
                let counters = gateway.stats().counters();
                info!(
                    clients = snapshot.total_clients,
                    streams = snapshot.total_subscription_groups,
                    subscriptions = snapshot.active_subscriptions,
                    ticks = counters.ticks_received,
                    delivered = counters.messages_delivered,
                    lagging_disconnects = counters.lagging_disconnects,
                    "Gateway stats"
                );
            }
        }
    }
}
