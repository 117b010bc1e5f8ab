//! Stream identity: instrument, interval and the derived key namespaces
//!
//! A `StreamKey` names exactly one upstream feed. The same key is used to
//! derive the cache key (`BTCUSDT:1m`), the broker routing key
//! (`BTCUSDT.kline.1m`) and the upstream stream name (`btcusdt@kline_1m`).
//! Two keys with different intervals for the same instrument are unrelated.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ParseError;

/// Longest instrument symbol accepted from clients.
pub const MAX_INSTRUMENT_LEN: usize = 20;

/// Tradable instrument symbol, normalized to upper case (e.g. `BTCUSDT`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Instrument(String);

impl Instrument {
    /// Validate and normalize a symbol.
    ///
    /// Accepts 1..=20 ASCII alphanumerics in any case.
    pub fn new(symbol: &str) -> Result<Self, ParseError> {
        let symbol = symbol.trim();
        if symbol.is_empty()
            || symbol.len() > MAX_INSTRUMENT_LEN
            || !symbol.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(ParseError::InvalidInstrument(symbol.to_string()));
        }
        Ok(Self(symbol.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Instrument {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Instrument {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Instrument> for String {
    fn from(value: Instrument) -> Self {
        value.0
    }
}

/// Bar intervals supported by the upstream exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1s")]
    S1,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl Interval {
    /// Wire label, as used by the exchange and in every derived key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::S1 => "1s",
            Interval::M1 => "1m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H4 => "4h",
            Interval::H6 => "6h",
            Interval::H8 => "8h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
            Interval::D3 => "3d",
            Interval::W1 => "1w",
            Interval::Mo1 => "1M",
        }
    }

    /// All supported intervals.
    pub fn all() -> &'static [Interval] {
        &[
            Interval::S1,
            Interval::M1,
            Interval::M3,
            Interval::M5,
            Interval::M15,
            Interval::M30,
            Interval::H1,
            Interval::H2,
            Interval::H4,
            Interval::H6,
            Interval::H8,
            Interval::H12,
            Interval::D1,
            Interval::D3,
            Interval::W1,
            Interval::Mo1,
        ]
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::all()
            .iter()
            .copied()
            .find(|interval| interval.as_str() == s)
            .ok_or_else(|| ParseError::InvalidInterval(s.to_string()))
    }
}

/// Unique identifier of an upstream feed and of its cache/topic namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub instrument: Instrument,
    pub interval: Interval,
}

impl StreamKey {
    pub fn new(instrument: Instrument, interval: Interval) -> Self {
        Self {
            instrument,
            interval,
        }
    }

    /// Parse a key from raw client values.
    pub fn parse(instrument: &str, interval: &str) -> Result<Self, ParseError> {
        Ok(Self::new(Instrument::new(instrument)?, interval.parse()?))
    }

    /// Cache store key: `{instrument}:{interval}`.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.instrument, self.interval)
    }

    /// Broker routing key: `{instrument}.kline.{interval}`.
    pub fn routing_key(&self) -> String {
        format!("{}.kline.{}", self.instrument, self.interval)
    }

    /// Inverse of [`StreamKey::routing_key`].
    pub fn from_routing_key(routing_key: &str) -> Result<Self, ParseError> {
        let parts: Vec<&str> = routing_key.split('.').collect();
        match parts.as_slice() {
            [instrument, "kline", interval] => Self::parse(instrument, interval)
                .map_err(|_| ParseError::InvalidRoutingKey(routing_key.to_string())),
            _ => Err(ParseError::InvalidRoutingKey(routing_key.to_string())),
        }
    }

    /// Upstream stream name: `{instrument lowercase}@kline_{interval}`.
    pub fn upstream_stream(&self) -> String {
        format!(
            "{}@kline_{}",
            self.instrument.as_str().to_ascii_lowercase(),
            self.interval
        )
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instrument, self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn btc_1m() -> StreamKey {
        StreamKey::parse("btcusdt", "1m").unwrap()
    }

    #[test]
    fn test_instrument_normalized_to_upper_case() {
        let inst = Instrument::new(" ethUsdt ").unwrap();
        assert_eq!(inst.as_str(), "ETHUSDT");
    }

    #[test]
    fn test_instrument_rejects_garbage() {
        assert!(Instrument::new("").is_err());
        assert!(Instrument::new("BTC/USDT").is_err());
        assert!(Instrument::new("BTC.USDT").is_err());
        assert!(Instrument::new(&"A".repeat(MAX_INSTRUMENT_LEN + 1)).is_err());
    }

    #[test]
    fn test_interval_parse() {
        assert_eq!("1m".parse::<Interval>().unwrap(), Interval::M1);
        assert_eq!("1M".parse::<Interval>().unwrap(), Interval::Mo1);
        assert_eq!("4h".parse::<Interval>().unwrap(), Interval::H4);
        assert!("7m".parse::<Interval>().is_err());
        assert!("".parse::<Interval>().is_err());
    }

    #[test]
    fn test_interval_serde_uses_wire_label() {
        assert_eq!(serde_json::to_string(&Interval::M15).unwrap(), "\"15m\"");
        let parsed: Interval = serde_json::from_str("\"1w\"").unwrap();
        assert_eq!(parsed, Interval::W1);
    }

    #[test]
    fn test_derived_keys() {
        let key = btc_1m();
        assert_eq!(key.cache_key(), "BTCUSDT:1m");
        assert_eq!(key.routing_key(), "BTCUSDT.kline.1m");
        assert_eq!(key.upstream_stream(), "btcusdt@kline_1m");
        assert_eq!(key.to_string(), "BTCUSDT:1m");
    }

    #[test]
    fn test_from_routing_key() {
        let key = StreamKey::from_routing_key("ETHUSDT.kline.5m").unwrap();
        assert_eq!(key.instrument.as_str(), "ETHUSDT");
        assert_eq!(key.interval, Interval::M5);

        assert!(StreamKey::from_routing_key("ETHUSDT.trade.5m").is_err());
        assert!(StreamKey::from_routing_key("ETHUSDT.kline").is_err());
        assert!(StreamKey::from_routing_key("ETHUSDT.kline.9m").is_err());
    }

    #[test]
    fn test_same_instrument_different_interval_are_distinct() {
        let a = StreamKey::parse("BTCUSDT", "1m").unwrap();
        let b = StreamKey::parse("BTCUSDT", "5m").unwrap();
        assert_ne!(a, b);
        assert_ne!(a.cache_key(), b.cache_key());
        assert_ne!(a.routing_key(), b.routing_key());
    }

    #[test]
    fn test_instrument_deserialize_validates() {
        let ok: Instrument = serde_json::from_str("\"solusdt\"").unwrap();
        assert_eq!(ok.as_str(), "SOLUSDT");
        assert!(serde_json::from_str::<Instrument>("\"SOL-USDT\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_routing_key_roundtrip(symbol in "[A-Z0-9]{1,20}", idx in 0usize..16) {
            let interval = Interval::all()[idx];
            let key = StreamKey::new(Instrument::new(&symbol).unwrap(), interval);
            prop_assert_eq!(StreamKey::from_routing_key(&key.routing_key()).unwrap(), key);
        }
    }
}
