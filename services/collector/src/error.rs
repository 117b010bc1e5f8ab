//! Error types for the collector

use thiserror::Error;

/// Failures of a single upstream connection. All of them are recoverable:
/// the stream faults and reconnects while it still has demand.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out after {0}ms")]
    ConnectTimeout(u64),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("malformed kline frame: {0}")]
    Frame(String),

    #[error("closed by upstream")]
    ClosedByPeer,
}

#[derive(Error, Debug)]
pub enum IngestionError {
    /// The ingestion actor has stopped and no longer accepts requests.
    #[error("ingestion manager is not running")]
    Stopped,

    #[error("broker error: {0}")]
    Bus(#[from] bus::BusError),
}
