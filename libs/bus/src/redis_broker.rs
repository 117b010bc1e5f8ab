//! Redis-backed broker
//!
//! - Ticks: `PUBLISH {routing_key} {bar json}`, consumed with `PSUBSCRIBE`.
//! - Commands: `LPUSH stream_requests`, consumed with
//!   `BLMOVE stream_requests -> stream_requests:processing` and acknowledged
//!   with `LREM`. Anything left in the processing list after a crash is moved
//!   back by [`RedisBroker::recover_unacked`], giving at-least-once delivery.
//! - Collector announcements: `PUBLISH collector.presence {json}`.
//!
//! Blocking pops run on a dedicated connection so they never stall publishes
//! on the shared connection manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use types::command::StreamCommand;

use crate::error::{BusError, BusResult};
use crate::presence::{CollectorAnnouncement, PRESENCE_CHANNEL};
use crate::topic::TickMessage;
use crate::{Broker, Delivery, CONTROL_QUEUE, PROCESSING_QUEUE};

#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    pub url: String,
    pub queue: String,
    pub processing_queue: String,
    /// Blocking-pop timeout for `receive_command`.
    pub poll_timeout: Duration,
    /// Buffer between the pub/sub reader and the tick consumer.
    pub subscriber_capacity: usize,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            queue: CONTROL_QUEUE.to_string(),
            processing_queue: PROCESSING_QUEUE.to_string(),
            poll_timeout: Duration::from_secs(1),
            subscriber_capacity: 1024,
        }
    }
}

pub struct RedisBroker {
    client: redis::Client,
    publisher: ConnectionManager,
    consumer: Mutex<Option<MultiplexedConnection>>,
    config: RedisBrokerConfig,
    connected: AtomicBool,
}

impl RedisBroker {
    /// Open the client and the shared publishing connection.
    pub async fn connect(config: RedisBrokerConfig) -> BusResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let publisher = client.get_connection_manager().await?;
        info!(queue = %config.queue, "Connected to Redis broker");
        Ok(Self {
            client,
            publisher,
            consumer: Mutex::new(None),
            config,
            connected: AtomicBool::new(true),
        })
    }

    /// Move un-acknowledged commands back onto the control queue.
    ///
    /// Oldest commands end up at the consuming end, so replay keeps the
    /// order they were sent in.
    pub async fn recover_unacked(&self) -> BusResult<usize> {
        let mut con = self.publisher.clone();
        let mut recovered = 0;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.config.processing_queue)
                .arg(&self.config.queue)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut con)
                .await
                .map_err(|e| self.track(e))?;
            match moved {
                Some(_) => recovered += 1,
                None => break,
            }
        }
        if recovered > 0 {
            info!(recovered, "Requeued un-acknowledged stream commands");
        }
        Ok(recovered)
    }

    fn track(&self, err: redis::RedisError) -> BusError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            self.connected.store(false, Ordering::SeqCst);
        }
        BusError::Redis(err)
    }

    fn mark_ok(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }
}

/// Redis glob equivalent of a topic pattern.
fn glob_pattern(pattern: &str) -> String {
    pattern.replace('#', "*")
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish_tick(&self, tick: &TickMessage) -> BusResult<()> {
        let payload = tick.payload()?;
        let mut con = self.publisher.clone();
        let _: () = con
            .publish(tick.routing_key(), payload)
            .await
            .map_err(|e| self.track(e))?;
        self.mark_ok();
        Ok(())
    }

    async fn subscribe_ticks(&self, pattern: &str) -> BusResult<mpsc::Receiver<TickMessage>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| self.track(e))?;
        pubsub
            .psubscribe(glob_pattern(pattern))
            .await
            .map_err(|e| self.track(e))?;
        self.mark_ok();

        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity);
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Dropping non-text tick payload");
                        continue;
                    }
                };
                match TickMessage::decode(&channel, &payload) {
                    Ok(tick) => {
                        if tx.send(tick).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "Dropping malformed tick"),
                }
            }
            debug!(pattern = %pattern, "Redis tick subscription ended");
        });

        Ok(rx)
    }

    async fn send_command(&self, command: &StreamCommand) -> BusResult<()> {
        let mut con = self.publisher.clone();
        let _: () = con
            .lpush(&self.config.queue, command.to_json())
            .await
            .map_err(|e| self.track(e))?;
        self.mark_ok();
        Ok(())
    }

    async fn receive_command(&self) -> BusResult<Option<Delivery>> {
        let mut guard = self.consumer.lock().await;
        if guard.is_none() {
            let con = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| self.track(e))?;
            *guard = Some(con);
        }
        let Some(con) = guard.as_mut() else {
            return Ok(None);
        };

        let popped: Result<Option<String>, redis::RedisError> = redis::cmd("BLMOVE")
            .arg(&self.config.queue)
            .arg(&self.config.processing_queue)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(self.config.poll_timeout.as_secs_f64())
            .query_async(con)
            .await;

        let raw = match popped {
            Ok(raw) => raw,
            Err(e) => {
                *guard = None;
                return Err(self.track(e));
            }
        };
        drop(guard);
        self.mark_ok();

        let Some(raw) = raw else {
            return Ok(None);
        };

        match StreamCommand::from_json(&raw) {
            Ok(command) => Ok(Some(Delivery::new(command, raw))),
            Err(e) => {
                // A payload that never parses would be redelivered forever.
                warn!(error = %e, payload = %raw, "Discarding malformed stream command");
                let mut con = self.publisher.clone();
                let _: () = con
                    .lrem(&self.config.processing_queue, 1, &raw)
                    .await
                    .map_err(|e| self.track(e))?;
                Ok(None)
            }
        }
    }

    async fn ack_command(&self, delivery: &Delivery) -> BusResult<()> {
        let mut con = self.publisher.clone();
        let _: () = con
            .lrem(&self.config.processing_queue, 1, delivery.receipt())
            .await
            .map_err(|e| self.track(e))?;
        Ok(())
    }

    async fn announce_collector(&self, announcement: &CollectorAnnouncement) -> BusResult<()> {
        let payload = announcement.to_json()?;
        let mut con = self.publisher.clone();
        let receivers: i64 = con
            .publish(PRESENCE_CHANNEL, payload)
            .await
            .map_err(|e| self.track(e))?;
        self.mark_ok();
        debug!(instance = %announcement.instance, receivers, "Announced collector");
        Ok(())
    }

    async fn subscribe_announcements(&self) -> BusResult<mpsc::Receiver<CollectorAnnouncement>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| self.track(e))?;
        pubsub
            .subscribe(PRESENCE_CHANNEL)
            .await
            .map_err(|e| self.track(e))?;
        self.mark_ok();

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Dropping non-text announcement");
                        continue;
                    }
                };
                match CollectorAnnouncement::from_json(&payload) {
                    Ok(announcement) => {
                        if tx.send(announcement).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed announcement"),
                }
            }
            debug!("Redis announcement subscription ended");
        });

        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_pattern() {
        assert_eq!(glob_pattern(crate::KLINE_PATTERN), "*.kline.*");
        assert_eq!(glob_pattern("BTCUSDT.#"), "BTCUSDT.*");
    }

    #[test]
    fn test_default_config_names() {
        let config = RedisBrokerConfig::default();
        assert_eq!(config.queue, "stream_requests");
        assert_eq!(config.processing_queue, "stream_requests:processing");
    }
}
