//! Upstream connections
//!
//! One WebSocket per StreamKey. The lifecycle is an explicit state machine:
//!
//! ```text
//!   connecting ──opened──▶ open
//!       │                   │
//!     failed  ◀──failed─────┤
//!       ▼                   │ close requested
//!    faulted ──reconnect──▶ connecting
//!       │                   ▼
//!       └──close requested─▶ closing ──closed──▶ closed
//! ```
//!
//! A faulted stream only goes back to `connecting` when the ingestion actor
//! decides it still has demand.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use types::bar::Bar;
use types::stream::StreamKey;

use crate::error::UpstreamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Faulted,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The socket handshake completed.
    Opened,
    /// Connect attempt failed, or the open socket errored or was closed by the peer.
    Failed,
    /// `release_stream` asked for the connection to go away.
    CloseRequested,
    /// The connection task has finished tearing down.
    Closed,
    /// The reconnect backoff elapsed and demand is still present.
    Reconnect,
}

impl ConnectionState {
    /// Next state for `event`, or `None` if the event does not apply here.
    pub fn on(self, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;
        match (self, event) {
            (S::Connecting, E::Opened) => Some(S::Open),
            (S::Connecting | S::Open, E::Failed) => Some(S::Faulted),
            (S::Connecting | S::Open, E::CloseRequested) => Some(S::Closing),
            (S::Faulted, E::CloseRequested) => Some(S::Closed),
            (S::Closing, E::Closed | E::Failed) => Some(S::Closed),
            (S::Faulted, E::Reconnect) => Some(S::Connecting),
            _ => None,
        }
    }

    /// Whether a socket may exist (or is about to) in this state.
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Closing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Faulted => "faulted",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opens upstream feeds.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, key: &StreamKey) -> Result<Box<dyn TickSource>, UpstreamError>;
}

/// An open upstream feed for one StreamKey.
#[async_trait]
pub trait TickSource: Send {
    /// Next bar from the feed. `Ok(None)` means the peer closed the stream.
    async fn next_bar(&mut self) -> Result<Option<Bar>, UpstreamError>;

    /// Close the feed from our side.
    async fn close(&mut self);
}

/// Connects to `{ws_url}/{symbol}@kline_{interval}`.
pub struct BinanceKlineConnector {
    ws_url: String,
}

impl BinanceKlineConnector {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn stream_url(&self, key: &StreamKey) -> String {
        format!("{}/{}", self.ws_url, key.upstream_stream())
    }
}

#[async_trait]
impl UpstreamConnector for BinanceKlineConnector {
    async fn connect(&self, key: &StreamKey) -> Result<Box<dyn TickSource>, UpstreamError> {
        let url = self.stream_url(key);
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        info!(stream = %key, url = %url, "Upstream socket connected");
        Ok(Box::new(BinanceKlineSource {
            key: key.clone(),
            socket,
        }))
    }
}

struct BinanceKlineSource {
    key: StreamKey,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TickSource for BinanceKlineSource {
    async fn next_bar(&mut self) -> Result<Option<Bar>, UpstreamError> {
        loop {
            let Some(frame) = self.socket.next().await else {
                return Ok(None);
            };
            match frame.map_err(|e| UpstreamError::Socket(e.to_string()))? {
                Message::Text(text) => match parse_kline_frame(&text) {
                    Ok(Some(bar)) => return Ok(Some(bar)),
                    Ok(None) => debug!(stream = %self.key, "Ignoring non-kline frame"),
                    Err(e) => warn!(stream = %self.key, error = %e, "Skipping malformed frame"),
                },
                Message::Ping(payload) => {
                    self.socket
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| UpstreamError::Socket(e.to_string()))?;
                }
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.socket.close(None).await {
            debug!(stream = %self.key, error = %e, "Upstream close handshake failed");
        }
    }
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "k")]
    kline: Option<KlinePayload>,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "o")]
    open: Decimal,
    #[serde(rename = "h")]
    high: Decimal,
    #[serde(rename = "l")]
    low: Decimal,
    #[serde(rename = "c")]
    close: Decimal,
    #[serde(rename = "v")]
    volume: Decimal,
    #[serde(rename = "n", default)]
    trades: u64,
    #[serde(rename = "x")]
    closed: bool,
    #[serde(rename = "q", default)]
    quote_volume: Decimal,
    #[serde(rename = "V", default)]
    taker_buy_base_volume: Decimal,
    #[serde(rename = "Q", default)]
    taker_buy_quote_volume: Decimal,
}

/// Decode one kline stream frame. Events other than `kline` yield `None`.
pub fn parse_kline_frame(text: &str) -> Result<Option<Bar>, UpstreamError> {
    let event: KlineEvent =
        serde_json::from_str(text).map_err(|e| UpstreamError::Frame(e.to_string()))?;
    if event.event != "kline" {
        return Ok(None);
    }
    let Some(k) = event.kline else {
        return Err(UpstreamError::Frame("kline event without payload".to_string()));
    };
    Ok(Some(Bar {
        timestamp: k.open_time,
        open: k.open,
        high: k.high,
        low: k.low,
        close: k.close,
        volume: k.volume,
        closed: k.closed,
        close_time: k.close_time,
        quote_volume: k.quote_volume,
        trades: k.trades,
        taker_buy_base_volume: k.taker_buy_base_volume,
        taker_buy_quote_volume: k.taker_buy_quote_volume,
    }))
}

/// Apply `timeout` to a connect attempt.
pub async fn connect_with_timeout(
    connector: &dyn UpstreamConnector,
    key: &StreamKey,
    timeout: Duration,
) -> Result<Box<dyn TickSource>, UpstreamError> {
    match tokio::time::timeout(timeout, connector.connect(key)).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamError::ConnectTimeout(timeout.as_millis() as u64)),
    }
}
