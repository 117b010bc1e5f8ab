//! Collector Service
//!
//! Fulfils demand for live kline streams:
//! - Consumes start/stop/reset commands from the broker's control queue
//! - Counts demand per stream (distinct origins with active interest)
//! - Opens exactly one upstream WebSocket per stream with demand, and closes
//!   it when demand drops to zero
//! - Appends closed bars to the rolling window and publishes every bar to
//!   the broker under `{instrument}.kline.{interval}`
//! - Announces itself at startup so gateways restate their demand
//!
//! # Architecture
//!
//! ```text
//!  control queue ──▶ control loop ──▶ IngestionManager (actor)
//!                                        │ ensure / release
//!                                  ┌─────┴──────┐
//!                                  ▼            ▼
//!                              connection   connection    (one task per stream)
//!                                  │            │
//!                          append closed bar, publish every bar
//! ```

pub mod config;
pub mod control;
pub mod demand;
pub mod error;
pub mod ingestion;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod stats;
pub mod upstream;

pub use config::CollectorConfig;
pub use demand::{ApplyOutcome, DemandChange, IngestionDemand};
pub use error::{IngestionError, UpstreamError};
pub use ingestion::{IngestionConfig, IngestionHandle, IngestionManager, IngestionSnapshot, StreamStatus};
pub use upstream::{BinanceKlineConnector, ConnectionEvent, ConnectionState, TickSource, UpstreamConnector};

pub const SERVICE_VERSION: &str = "0.1.0";
