//! Shared harness: in-memory broker and cache store, scripted history loader,
//! and the gateway's actor, control publisher, tick consumer and presence
//! listener wired the way the binary wires them.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus::{Broker, InMemoryBroker, TickMessage};
use gateway::config::GatewayConfig;
use gateway::control::ControlPublisher;
use gateway::delivery::{DeliveryGateway, GatewayHandle};
use gateway::fanout::{run_presence_listener, run_tick_consumer};
use gateway::session::{Outbox, SessionConfig};
use gateway::state::AppState;
use rolling_cache::{HistoricalLoader, LoaderError, MemoryStore, RollingCacheManager, WindowConfig};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::broadcast;
use types::bar::Bar;
use types::command::StreamCommand;
use types::ids::SessionId;
use types::stream::StreamKey;

pub const GATEWAY_ID: &str = "gw-test";

pub struct ScriptedLoader {
    pub bars: AtomicUsize,
    pub fail: AtomicBool,
    pub delay_ms: AtomicU64,
    pub calls: AtomicU64,
}

impl ScriptedLoader {
    pub fn new(bars: usize) -> Self {
        Self {
            bars: AtomicUsize::new(bars),
            fail: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl HistoricalLoader for ScriptedLoader {
    async fn load_history(&self, _key: &StreamKey, limit: usize) -> Result<Vec<Bar>, LoaderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(LoaderError::Status(503));
        }
        let count = self.bars.load(Ordering::SeqCst).min(limit) as i64;
        Ok((0..count).map(|i| bar(i * 60_000, true)).collect())
    }
}

pub fn bar(ts: i64, closed: bool) -> Bar {
    Bar::new(ts, Decimal::ONE, Decimal::TWO, Decimal::ONE, Decimal::TWO, Decimal::TEN, closed)
}

pub fn key(symbol: &str, interval: &str) -> StreamKey {
    StreamKey::parse(symbol, interval).unwrap()
}

pub fn btc_1m() -> StreamKey {
    key("BTCUSDT", "1m")
}

pub struct Harness {
    pub gateway: GatewayHandle,
    pub control: ControlPublisher,
    pub broker: Arc<InMemoryBroker>,
    pub loader: Arc<ScriptedLoader>,
    pub cache: Arc<RollingCacheManager>,
    pub config: GatewayConfig,
    pub shutdown: broadcast::Sender<()>,
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        queue_capacity: 256,
        ..SessionConfig::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(session_config(), 50).await
}

pub async fn harness_with(session: SessionConfig, history: usize) -> Harness {
    let broker = Arc::new(InMemoryBroker::new());
    let loader = Arc::new(ScriptedLoader::new(history));
    let cache = Arc::new(RollingCacheManager::new(
        Arc::new(MemoryStore::new()),
        loader.clone(),
        WindowConfig {
            capacity: 100,
            history_limit: 100,
            ..WindowConfig::default()
        },
    ));

    let config = GatewayConfig {
        gateway_id: GATEWAY_ID.to_string(),
        session: session.clone(),
        broker_retry: Duration::from_millis(100),
        ..GatewayConfig::default()
    };

    let (shutdown, _) = broadcast::channel(1);
    let (control, _) = ControlPublisher::spawn(
        broker.clone(),
        GATEWAY_ID,
        config.broker_retry,
        shutdown.subscribe(),
    );
    let (gateway, _) = DeliveryGateway::spawn(cache.clone(), control.clone(), session);
    tokio::spawn(run_tick_consumer(
        broker.clone(),
        gateway.clone(),
        config.broker_retry,
        shutdown.subscribe(),
    ));
    tokio::spawn(run_presence_listener(
        broker.clone(),
        gateway.clone(),
        config.broker_retry,
        shutdown.subscribe(),
    ));

    let harness = Harness {
        gateway,
        control,
        broker,
        loader,
        cache,
        config,
        shutdown,
    };
    harness.wait_for_tick_stream().await;
    harness.wait_for_presence().await;
    harness
}

impl Harness {
    pub async fn wait_for_tick_stream(&self) {
        for _ in 0..500 {
            if self.broker.subscriber_count() > 0 && self.gateway.stats().tick_stream() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tick consumer never subscribed");
    }

    pub async fn wait_for_presence(&self) {
        let broker = self.broker.clone();
        wait_until("presence subscription", move || broker.announcement_subscriber_count() > 0).await;
    }

    pub async fn client(&self) -> Client {
        let id = SessionId::new();
        let outbox = self.gateway.connect(id).await.unwrap();
        Client { id, outbox }
    }

    pub async fn publish(&self, key: &StreamKey, bar: Bar) {
        self.broker
            .publish_tick(&TickMessage::new(key.clone(), bar))
            .await
            .unwrap();
    }

    /// Every command the publisher has handed to the broker, once the
    /// publisher is idle.
    pub async fn commands(&self) -> Vec<StreamCommand> {
        // Requests reach the publisher through the actor's mailbox first.
        self.gateway.snapshot().await.unwrap();
        for _ in 0..500 {
            if self.control.status().queued == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.broker.command_log()
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.gateway.clone(),
            self.control.clone(),
            self.cache.clone(),
            self.broker.clone(),
            self.config.clone(),
        )
    }
}

pub struct Client {
    pub id: SessionId,
    pub outbox: Arc<Outbox>,
}

impl Client {
    /// Next event, failing the test if none arrives.
    pub async fn event(&self) -> Value {
        let payload = tokio::time::timeout(Duration::from_secs(5), self.outbox.next())
            .await
            .expect("timed out waiting for an event")
            .expect("outbox closed");
        serde_json::from_str(&payload).unwrap()
    }

    /// Next event if one shows up shortly.
    pub async fn maybe_event(&self) -> Option<Value> {
        match tokio::time::timeout(Duration::from_millis(300), self.outbox.next()).await {
            Ok(Some(payload)) => Some(serde_json::from_str(&payload).unwrap()),
            _ => None,
        }
    }

    /// Consume the snapshot and acknowledgment for one subscribe.
    pub async fn expect_subscribed(&self) -> Value {
        let snapshot = self.event().await;
        let ack = self.event().await;
        assert_eq!(ack["type"], "subscribed");
        snapshot
    }
}

pub fn actions(commands: &[StreamCommand]) -> Vec<&'static str> {
    commands.iter().map(|c| c.action()).collect()
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
