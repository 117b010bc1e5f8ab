//! OHLCV bar ("candle") for one interval of one instrument
//!
//! A bar with `closed = false` is the in-progress interval and may be
//! replaced by later updates carrying the same `timestamp`. Once a bar is
//! closed it never changes.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single OHLCV bar.
///
/// `timestamp` and `close_time` are Unix milliseconds, matching the
/// exchange's kline payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// Open time of the interval.
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Whether the interval has finished.
    pub closed: bool,
    #[serde(default)]
    pub close_time: i64,
    #[serde(default)]
    pub quote_volume: Decimal,
    #[serde(default)]
    pub trades: u64,
    #[serde(default)]
    pub taker_buy_base_volume: Decimal,
    #[serde(default)]
    pub taker_buy_quote_volume: Decimal,
}

impl Bar {
    /// Build a bar with only the core OHLCV fields populated.
    pub fn new(
        timestamp: i64,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        closed: bool,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            closed,
            close_time: 0,
            quote_volume: Decimal::ZERO,
            trades: 0,
            taker_buy_base_volume: Decimal::ZERO,
            taker_buy_quote_volume: Decimal::ZERO,
        }
    }

    /// Validate OHLCV invariants.
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= Decimal::ZERO
            && (self.close_time == 0 || self.close_time > self.timestamp)
    }

    /// Whether `other` describes the same interval as `self`.
    pub fn same_period(&self, other: &Bar) -> bool {
        self.timestamp == other.timestamp
    }
}
