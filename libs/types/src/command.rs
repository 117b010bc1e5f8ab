//! Control commands carried on the durable stream-management queue
//!
//! The gateway emits `start`/`stop` when its local demand for a key crosses
//! zero, and `reset` when it (re)starts. Commands are delivered at least once,
//! so each one carries the emitting gateway's `origin` and a per-origin
//! increasing `seq` that lets the collector discard stale redeliveries.

use serde::{Deserialize, Serialize};

use crate::errors::ParseError;
use crate::stream::{Instrument, Interval, StreamKey};

/// Origin used when a legacy producer omits one.
pub const ANONYMOUS_ORIGIN: &str = "anonymous";

fn anonymous_origin() -> String {
    ANONYMOUS_ORIGIN.to_string()
}

/// Start/stop/reset command.
///
/// Wire form: `{"action":"start","instrument":"BTCUSDT","interval":"1m","origin":"gw-1","seq":7}`.
/// `subscribe`/`unsubscribe` and `symbol` are accepted for compatibility with
/// older producers. `seq == 0` means "unsequenced" and is always applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum StreamCommand {
    #[serde(alias = "subscribe")]
    Start {
        #[serde(alias = "symbol")]
        instrument: Instrument,
        interval: Interval,
        #[serde(default = "anonymous_origin")]
        origin: String,
        #[serde(default)]
        seq: u64,
    },
    #[serde(alias = "unsubscribe")]
    Stop {
        #[serde(alias = "symbol")]
        instrument: Instrument,
        interval: Interval,
        #[serde(default = "anonymous_origin")]
        origin: String,
        #[serde(default)]
        seq: u64,
    },
    /// Drop every interest previously registered by `origin`.
    Reset {
        origin: String,
        #[serde(default)]
        seq: u64,
    },
}

impl StreamCommand {
    pub fn start(key: &StreamKey, origin: impl Into<String>, seq: u64) -> Self {
        StreamCommand::Start {
            instrument: key.instrument.clone(),
            interval: key.interval,
            origin: origin.into(),
            seq,
        }
    }

    pub fn stop(key: &StreamKey, origin: impl Into<String>, seq: u64) -> Self {
        StreamCommand::Stop {
            instrument: key.instrument.clone(),
            interval: key.interval,
            origin: origin.into(),
            seq,
        }
    }

    pub fn reset(origin: impl Into<String>, seq: u64) -> Self {
        StreamCommand::Reset {
            origin: origin.into(),
            seq,
        }
    }

    /// Decode a queue payload.
    pub fn from_json(payload: &str) -> Result<Self, ParseError> {
        serde_json::from_str(payload).map_err(|e| ParseError::InvalidCommand(e.to_string()))
    }

    /// Encode for the queue.
    pub fn to_json(&self) -> String {
        // Serializing a plain enum of strings and integers cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Stream the command refers to; `None` for `reset`.
    pub fn stream_key(&self) -> Option<StreamKey> {
        match self {
            StreamCommand::Start {
                instrument,
                interval,
                ..
            }
            | StreamCommand::Stop {
                instrument,
                interval,
                ..
            } => Some(StreamKey::new(instrument.clone(), *interval)),
            StreamCommand::Reset { .. } => None,
        }
    }

    pub fn origin(&self) -> &str {
        match self {
            StreamCommand::Start { origin, .. }
            | StreamCommand::Stop { origin, .. }
            | StreamCommand::Reset { origin, .. } => origin,
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            StreamCommand::Start { seq, .. }
            | StreamCommand::Stop { seq, .. }
            | StreamCommand::Reset { seq, .. } => *seq,
        }
    }

    /// Action label for logging.
    pub fn action(&self) -> &'static str {
        match self {
            StreamCommand::Start { .. } => "start",
            StreamCommand::Stop { .. } => "stop",
            StreamCommand::Reset { .. } => "reset",
        }
    }
}
