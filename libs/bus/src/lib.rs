//! Broker abstraction for the candle pipeline
//!
//! Two channels run over the broker:
//! - the kline topic stream, published by the collector under
//!   `{instrument}.kline.{interval}` and consumed by every gateway instance
//!   through a single pattern subscription;
//! - the durable `stream_requests` control queue carrying start/stop/reset
//!   commands from gateways to the collector, delivered at least once;
//! - the `collector.presence` channel, on which a starting collector asks
//!   every gateway to restate its demand.
//!
//! ```text
//!  Collector ──publish_tick──▶ [ *.kline.* ] ──subscribe_ticks──▶ Gateway
//!  Collector ◀─receive/ack──── [ stream_requests ] ◀─send_command─ Gateway
//!  Collector ──announce──────▶ [ collector.presence ] ──────────▶ Gateway
//! ```

pub mod error;
pub mod memory;
pub mod presence;
pub mod redis_broker;
pub mod topic;

use async_trait::async_trait;
use tokio::sync::mpsc;
use types::command::StreamCommand;

pub use error::{BusError, BusResult};
pub use memory::InMemoryBroker;
pub use presence::{CollectorAnnouncement, PRESENCE_CHANNEL};
pub use redis_broker::{RedisBroker, RedisBrokerConfig};
pub use topic::{topic_matches, TickMessage, KLINE_PATTERN};

/// Name of the durable control queue.
pub const CONTROL_QUEUE: &str = "stream_requests";

/// List holding commands that were handed out but not yet acknowledged.
pub const PROCESSING_QUEUE: &str = "stream_requests:processing";

/// A control command handed to a consumer, to be acknowledged once applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub command: StreamCommand,
    receipt: String,
}

impl Delivery {
    pub(crate) fn new(command: StreamCommand, receipt: String) -> Self {
        Self { command, receipt }
    }

    /// Opaque token identifying this delivery to the broker.
    pub fn receipt(&self) -> &str {
        &self.receipt
    }
}

/// Topic-routed pub/sub plus a durable command queue.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a tick under its routing key.
    async fn publish_tick(&self, tick: &TickMessage) -> BusResult<()>;

    /// Subscribe to every tick whose routing key matches `pattern`.
    ///
    /// The receiver closes when the underlying subscription is lost; callers
    /// are expected to subscribe again.
    async fn subscribe_ticks(&self, pattern: &str) -> BusResult<mpsc::Receiver<TickMessage>>;

    /// Enqueue a control command.
    async fn send_command(&self, command: &StreamCommand) -> BusResult<()>;

    /// Wait for the next control command. `Ok(None)` after an idle poll.
    async fn receive_command(&self) -> BusResult<Option<Delivery>>;

    /// Acknowledge a delivery so it is not handed out again.
    async fn ack_command(&self, delivery: &Delivery) -> BusResult<()>;

    /// Tell every gateway that a collector started with empty demand.
    async fn announce_collector(&self, announcement: &CollectorAnnouncement) -> BusResult<()>;

    /// Subscribe to collector announcements. Like `subscribe_ticks`, the
    /// receiver closes when the subscription is lost.
    async fn subscribe_announcements(&self) -> BusResult<mpsc::Receiver<CollectorAnnouncement>>;

    /// Best-effort connectivity flag for health reporting.
    fn is_connected(&self) -> bool {
        true
    }
}
