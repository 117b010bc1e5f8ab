//! Historical bar loader
//!
//! The default implementation reads `GET {base}/klines` from the exchange's
//! public REST surface. Rows arrive as heterogeneous JSON arrays:
//! `[openTime, open, high, low, close, volume, closeTime, quoteVolume,
//! trades, takerBuyBase, takerBuyQuote, ignore]`, prices as strings.

use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};
use types::bar::Bar;
use types::stream::StreamKey;

use crate::error::LoaderError;

/// Exchange REST base used when nothing else is configured.
pub const DEFAULT_REST_URL: &str = "https://api.binance.com/api/v3";

#[async_trait]
pub trait HistoricalLoader: Send + Sync {
    /// Most recent `limit` bars for `key`, oldest first.
    async fn load_history(&self, key: &StreamKey, limit: usize) -> Result<Vec<Bar>, LoaderError>;
}

pub struct BinanceRestLoader {
    client: Client,
    base_url: String,
}

impl BinanceRestLoader {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, LoaderError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LoaderError::Http(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, key: &StreamKey, limit: usize) -> String {
        format!(
            "{}/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            key.instrument.as_str(),
            key.interval.as_str(),
            limit
        )
    }
}

#[async_trait]
impl HistoricalLoader for BinanceRestLoader {
    async fn load_history(&self, key: &StreamKey, limit: usize) -> Result<Vec<Bar>, LoaderError> {
        let url = self.url(key, limit);
        debug!(url = %url, "Requesting kline history");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LoaderError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(stream = %key, status = status.as_u16(), "Kline history request rejected");
            return Err(LoaderError::Status(status.as_u16()));
        }

        let rows: Vec<Vec<Value>> = response
            .json()
            .await
            .map_err(|e| LoaderError::Decode(e.to_string()))?;

        let now = now_millis();
        rows.iter().map(|row| parse_kline_row(row, now)).collect()
    }
}

/// Parse one REST kline row. The row counts as closed once its close time
/// is behind `now_ms`.
pub fn parse_kline_row(row: &[Value], now_ms: i64) -> Result<Bar, LoaderError> {
    if row.len() < 11 {
        return Err(LoaderError::Decode(format!(
            "expected at least 11 columns, got {}",
            row.len()
        )));
    }

    let close_time = int_field(&row[6], "close_time")?;
    Ok(Bar {
        timestamp: int_field(&row[0], "open_time")?,
        open: decimal_field(&row[1], "open")?,
        high: decimal_field(&row[2], "high")?,
        low: decimal_field(&row[3], "low")?,
        close: decimal_field(&row[4], "close")?,
        volume: decimal_field(&row[5], "volume")?,
        closed: close_time < now_ms,
        close_time,
        quote_volume: decimal_field(&row[7], "quote_volume")?,
        trades: int_field(&row[8], "trades")?.max(0) as u64,
        taker_buy_base_volume: decimal_field(&row[9], "taker_buy_base_volume")?,
        taker_buy_quote_volume: decimal_field(&row[10], "taker_buy_quote_volume")?,
    })
}

fn int_field(value: &Value, name: &str) -> Result<i64, LoaderError> {
    value
        .as_i64()
        .ok_or_else(|| LoaderError::Decode(format!("{name} is not an integer: {value}")))
}

fn decimal_field(value: &Value, name: &str) -> Result<Decimal, LoaderError> {
    let parsed = match value {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    };
    parsed.ok_or_else(|| LoaderError::Decode(format!("{name} is not a decimal: {value}")))
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
