//! Types library for the candle distribution pipeline
//!
//! Shared by the collector (ingestion) and the gateway (delivery) so that
//! both sides agree on keys, routing and the control-command wire format.
//!
//! # Modules
//! - `ids`: Session identifiers
//! - `stream`: Instrument, Interval and the StreamKey namespace
//! - `bar`: OHLCV bars
//! - `command`: Start/stop/reset control commands
//! - `errors`: Parse and validation errors

pub mod bar;
pub mod command;
pub mod errors;
pub mod ids;
pub mod stream;

pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bar::*;
    pub use crate::command::*;
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::stream::*;
}
