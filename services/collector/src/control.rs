//! Control-queue consumer
//!
//! Pulls stream commands off the broker, applies each through the ingestion
//! actor, and acknowledges it only after it has been applied. A command that
//! is delivered again after a crash is absorbed by the demand counts.
//!
//! A collector starts with no demand, so it also announces itself; gateways
//! answer by restating theirs on the control queue.

use std::sync::Arc;
use std::time::Duration;

use bus::{Broker, CollectorAnnouncement};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::demand::ApplyOutcome;
use crate::ingestion::IngestionHandle;

pub async fn run_control_loop(
    broker: Arc<dyn Broker>,
    ingestion: IngestionHandle,
    retry: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("Control consumer started");

    loop {
        let received = tokio::select! {
            _ = shutdown.recv() => break,
            received = broker.receive_command() => received,
        };

        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, retry_ms = retry.as_millis() as u64, "Control queue unavailable");
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(retry) => continue,
                }
            }
        };

        let command = delivery.command.clone();
        match ingestion.apply(command.clone()).await {
            Ok(ApplyOutcome::Stale) => {
                debug!(action = command.action(), origin = command.origin(), seq = command.seq(), "Stale command acknowledged");
            }
            Ok(ApplyOutcome::Applied(changes)) => {
                info!(
                    action = command.action(),
                    origin = command.origin(),
                    stream = %command.stream_key().map(|k| k.to_string()).unwrap_or_default(),
                    transitions = changes.len(),
                    "Stream command applied"
                );
            }
            Err(e) => {
                // Left un-acknowledged so it is redelivered after restart.
                warn!(error = %e, "Ingestion stopped, leaving command in flight");
                break;
            }
        }

        if let Err(e) = broker.ack_command(&delivery).await {
            warn!(error = %e, "Failed to acknowledge stream command");
        }
    }

    info!("Control consumer stopped");
}

/// Publish `announcement`, retrying every `retry` while the broker is
/// unreachable. Returns whether it went out.
pub async fn announce_presence(
    broker: Arc<dyn Broker>,
    announcement: CollectorAnnouncement,
    retry: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> bool {
    loop {
        match broker.announce_collector(&announcement).await {
            Ok(()) => {
                info!(instance = %announcement.instance, "Collector announced, awaiting demand");
                return true;
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, retry_ms = retry.as_millis() as u64, "Announcement failed, retrying");
            }
            Err(e) => {
                error!(error = %e, "Announcement cannot be sent");
                return false;
            }
        }
        tokio::select! {
            _ = shutdown.recv() => return false,
            _ = tokio::time::sleep(retry) => {}
        }
    }
}
