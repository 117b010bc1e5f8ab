//! Client wire format
//!
//! Client → gateway, JSON text frames tagged by `type`:
//!
//! ```json
//! {"type":"subscribe","instrument":"BTCUSDT","interval":"1m"}
//! {"type":"unsubscribe","symbol":"btcusdt","interval":"1m"}
//! {"type":"ping"}
//! ```
//!
//! Gateway → client: `historical_data`, `kline_update`, `subscribed`,
//! `unsubscribed`, `error` and `pong`.

use serde::{Deserialize, Serialize};
use types::bar::Bar;
use types::errors::ParseError;
use types::stream::{Instrument, Interval, StreamKey};

use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamRequest {
    #[serde(alias = "symbol")]
    pub instrument: String,
    pub interval: String,
}

impl StreamRequest {
    pub fn key(&self) -> Result<StreamKey, ParseError> {
        StreamKey::parse(&self.instrument, &self.interval)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe(StreamRequest),
    Unsubscribe(StreamRequest),
    Ping,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(text).map_err(|e| GatewayError::Protocol(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    HistoricalData {
        instrument: Instrument,
        interval: Interval,
        bars: Vec<Bar>,
    },
    KlineUpdate {
        instrument: Instrument,
        interval: Interval,
        bar: Bar,
    },
    Subscribed {
        instrument: Instrument,
        interval: Interval,
    },
    Unsubscribed {
        instrument: Instrument,
        interval: Interval,
    },
    Error {
        message: String,
    },
    Pong,
}

impl ServerEvent {
    pub fn historical_data(key: &StreamKey, bars: Vec<Bar>) -> Self {
        ServerEvent::HistoricalData {
            instrument: key.instrument.clone(),
            interval: key.interval,
            bars,
        }
    }

    pub fn kline_update(key: &StreamKey, bar: Bar) -> Self {
        ServerEvent::KlineUpdate {
            instrument: key.instrument.clone(),
            interval: key.interval,
            bar,
        }
    }

    pub fn subscribed(key: &StreamKey) -> Self {
        ServerEvent::Subscribed {
            instrument: key.instrument.clone(),
            interval: key.interval,
        }
    }

    pub fn unsubscribed(key: &StreamKey) -> Self {
        ServerEvent::Unsubscribed {
            instrument: key.instrument.clone(),
            interval: key.interval,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, GatewayError> {
        Ok(serde_json::to_string(self)?)
    }
}
