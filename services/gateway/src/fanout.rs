//! Broker consumers
//!
//! One pattern subscription (`*.kline.*`) per gateway instance. Every tick is
//! forwarded to the delivery actor, which filters by subscription. A lost
//! subscription is re-established after the retry delay, indefinitely.
//!
//! The presence listener answers every collector announcement with a resync,
//! so a restarted collector relearns this gateway's demand. A presence
//! subscription that had to be re-established resyncs too, since an
//! announcement may have gone by while it was down.

use std::sync::Arc;
use std::time::Duration;

use bus::{Broker, KLINE_PATTERN};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::delivery::GatewayHandle;
use crate::stats::GatewayStats;

pub async fn run_tick_consumer(
    broker: Arc<dyn Broker>,
    gateway: GatewayHandle,
    retry: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let stats = gateway.stats();

    'subscribe: loop {
        let subscribed = tokio::select! {
            _ = shutdown.recv() => break 'subscribe,
            subscribed = broker.subscribe_ticks(KLINE_PATTERN) => subscribed,
        };

        match subscribed {
            Ok(mut ticks) => {
                stats.set_tick_stream(true);
                info!(pattern = KLINE_PATTERN, "Subscribed to tick stream");

                loop {
                    let tick = tokio::select! {
                        _ = shutdown.recv() => break 'subscribe,
                        tick = ticks.recv() => tick,
                    };
                    let Some(tick) = tick else {
                        break;
                    };
                    if gateway.tick(tick).is_err() {
                        warn!("Delivery actor stopped, tick consumer exiting");
                        break 'subscribe;
                    }
                }

                stats.set_tick_stream(false);
                warn!(retry_ms = retry.as_millis() as u64, "Tick subscription lost, resubscribing");
            }
            Err(e) => {
                warn!(error = %e, retry_ms = retry.as_millis() as u64, "Tick subscription failed");
            }
        }

        tokio::select! {
            _ = shutdown.recv() => break 'subscribe,
            _ = tokio::time::sleep(retry) => {}
        }
    }

    stats.set_tick_stream(false);
    info!("Tick consumer stopped");
}

pub async fn run_presence_listener(
    broker: Arc<dyn Broker>,
    gateway: GatewayHandle,
    retry: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let stats = gateway.stats();
    let mut resubscribed = false;

    'subscribe: loop {
        let subscribed = tokio::select! {
            _ = shutdown.recv() => break 'subscribe,
            subscribed = broker.subscribe_announcements() => subscribed,
        };

        match subscribed {
            Ok(mut announcements) => {
                info!("Listening for collector announcements");
                if resubscribed {
                    GatewayStats::incr(&stats.resyncs);
                    if gateway.resync().is_err() {
                        break 'subscribe;
                    }
                }

                loop {
                    let announcement = tokio::select! {
                        _ = shutdown.recv() => break 'subscribe,
                        announcement = announcements.recv() => announcement,
                    };
                    let Some(announcement) = announcement else {
                        break;
                    };
                    debug!(
                        instance = %announcement.instance,
                        started_at = announcement.started_at,
                        "Collector announced"
                    );
                    GatewayStats::incr(&stats.resyncs);
                    if gateway.resync().is_err() {
                        warn!("Delivery actor stopped, presence listener exiting");
                        break 'subscribe;
                    }
                }

                warn!(retry_ms = retry.as_millis() as u64, "Presence subscription lost, resubscribing");
            }
            Err(e) => {
                warn!(error = %e, retry_ms = retry.as_millis() as u64, "Presence subscription failed");
            }
        }
        resubscribed = true;

        tokio::select! {
            _ = shutdown.recv() => break 'subscribe,
            _ = tokio::time::sleep(retry) => {}
        }
    }

    info!("Presence listener stopped");
}
