//! Gateway Service
//!
//! Client-facing half of the candle pipeline:
//! - Accepts WebSocket sessions and tracks each session's subscriptions
//! - Counts demand per stream and sends start/stop to the collector when it
//!   crosses zero
//! - Serves the rolling window as an on-subscribe snapshot
//! - Consumes every kline tick from the broker and forwards it only to
//!   sessions subscribed to that stream
//! - Restates its demand whenever a collector announces that it started
//!
//! # Architecture
//!
//! ```text
//!  client ─ws─▶ socket task ──▶ DeliveryGateway (actor) ──▶ ControlPublisher ──▶ control queue
//!                   ▲                  │      ▲
//!                   └──── outbox ◀─────┘      └── tick consumer ◀── *.kline.*
//! ```

pub mod config;
pub mod control;
pub mod delivery;
pub mod demand;
pub mod error;
pub mod fanout;
pub mod handlers;
pub mod protocol;
pub mod rate_limit;
pub mod router;
pub mod session;
pub mod state;
pub mod stats;

pub use config::GatewayConfig;
pub use control::{ControlPublisher, ControlStatus};
pub use delivery::{DeliveryGateway, GatewayHandle};
pub use demand::{DemandTransition, GatewayDemand};
pub use error::{AppError, GatewayError};
pub use protocol::{ClientMessage, ServerEvent};
pub use session::{DropPolicy, Outbox, SessionConfig, SessionRegistry};
pub use stats::{GatewaySnapshot, GatewayStats};

pub const SERVICE_VERSION: &str = "0.1.0";
