//! Kline topic routing
//!
//! Routing keys are dot-separated words (`BTCUSDT.kline.1m`). Patterns follow
//! topic-exchange rules: `*` matches exactly one word, `#` matches zero or
//! more words.

use serde::{Deserialize, Serialize};
use types::bar::Bar;
use types::errors::ParseError;
use types::stream::StreamKey;

/// Pattern matching every kline routing key.
pub const KLINE_PATTERN: &str = "*.kline.*";

/// One tick as it travels over the broker.
///
/// On the wire the key is the routing key and the payload is the bar JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickMessage {
    pub key: StreamKey,
    pub bar: Bar,
}

impl TickMessage {
    pub fn new(key: StreamKey, bar: Bar) -> Self {
        Self { key, bar }
    }

    pub fn routing_key(&self) -> String {
        self.key.routing_key()
    }

    /// Bar payload as published.
    pub fn payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.bar)
    }

    /// Rebuild a tick from a routing key and payload.
    pub fn decode(routing_key: &str, payload: &str) -> Result<Self, ParseError> {
        let key = StreamKey::from_routing_key(routing_key)?;
        let bar = serde_json::from_str(payload)
            .map_err(|e| ParseError::InvalidCommand(format!("bad bar payload on {routing_key}: {e}")))?;
        Ok(Self { key, bar })
    }
}

/// Topic-exchange style match of `routing_key` against `pattern`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &words)
}

fn matches_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| matches_words(rest, &words[skip..])),
        Some((head, rest)) => match words.split_first() {
            Some((word, remaining)) if *head == "*" || head == word => matches_words(rest, remaining),
            _ => false,
        },
    }
}
