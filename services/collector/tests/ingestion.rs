//! Ingestion Manager lifecycle tests
//!
//! Drives the actor with a scripted upstream and the in-memory broker:
//! - one connection per stream regardless of duplicate ensures
//! - closed bars reach the window, every bar reaches the broker, in order
//! - reconnect only while demand remains
//! - demand dropping to zero closes the socket and cancels pending timers
//! - a new stream gets its rolling window before the first bar is read
//! - the control consumer applies and acknowledges queued commands
//! - the presence announcement is retried through a broker outage

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus::{Broker, CollectorAnnouncement, InMemoryBroker, KLINE_PATTERN};
use collector::control::{announce_presence, run_control_loop};
use collector::ingestion::{IngestionConfig, IngestionHandle, IngestionManager};
use collector::mock::MockConnector;
use collector::upstream::ConnectionState;
use rolling_cache::{HistoricalLoader, LoaderError, MemoryStore, RollingCacheManager, WindowConfig};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use types::bar::Bar;
use types::command::StreamCommand;
use types::stream::StreamKey;

const BACKOFF: Duration = Duration::from_secs(5);

struct StaticLoader {
    bars: usize,
}

#[async_trait]
impl HistoricalLoader for StaticLoader {
    async fn load_history(&self, _key: &StreamKey, limit: usize) -> Result<Vec<Bar>, LoaderError> {
        Ok((0..self.bars.min(limit) as i64).map(|i| bar(i * 60_000, true)).collect())
    }
}

fn bar(ts: i64, closed: bool) -> Bar {
    Bar::new(ts, Decimal::ONE, Decimal::TWO, Decimal::ONE, Decimal::TWO, Decimal::TEN, closed)
}

fn btc() -> StreamKey {
    StreamKey::parse("BTCUSDT", "1m").unwrap()
}

struct Harness {
    ingestion: IngestionHandle,
    connector: MockConnector,
    broker: Arc<InMemoryBroker>,
    cache: Arc<RollingCacheManager>,
}

fn harness() -> Harness {
    let connector = MockConnector::new();
    let broker = Arc::new(InMemoryBroker::with_poll_interval(Duration::from_millis(50)));
    let cache = Arc::new(RollingCacheManager::new(
        Arc::new(MemoryStore::new()),
        Arc::new(StaticLoader { bars: 10 }),
        WindowConfig {
            capacity: 10,
            ..WindowConfig::default()
        },
    ));
    let (ingestion, _task) = IngestionManager::spawn(
        Arc::new(connector.clone()),
        cache.clone(),
        broker.clone(),
        IngestionConfig {
            connect_timeout: Duration::from_secs(5),
            reconnect_backoff: BACKOFF,
        },
    );
    Harness {
        ingestion,
        connector,
        broker,
        cache,
    }
}

async fn state(h: &Harness, key: &StreamKey) -> Option<ConnectionState> {
    h.ingestion.snapshot().await.unwrap().state_of(key)
}

async fn wait_for_state(h: &Harness, key: &StreamKey, expected: Option<ConnectionState>) {
    for _ in 0..2000 {
        if state(h, key).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("stream {key} never reached {expected:?}, last {:?}", state(h, key).await);
}

#[tokio::test(start_paused = true)]
async fn test_ensure_is_idempotent() {
    let h = harness();
    h.ingestion.ensure_stream(btc()).await.unwrap();
    h.ingestion.ensure_stream(btc()).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;
    h.ingestion.ensure_stream(btc()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.connector.connects(&btc()), 1);
    assert_eq!(h.connector.open_feeds(&btc()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_release_is_idempotent() {
    let h = harness();
    h.ingestion.release_stream(btc()).await.unwrap();
    h.ingestion.ensure_stream(btc()).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;

    h.ingestion.release_stream(btc()).await.unwrap();
    h.ingestion.release_stream(btc()).await.unwrap();
    wait_for_state(&h, &btc(), None).await;
    assert_eq!(h.connector.open_feeds(&btc()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_closed_bars_cached_and_every_bar_published() {
    let h = harness();
    let mut ticks = h.broker.subscribe_ticks(KLINE_PATTERN).await.unwrap();
    h.cache.fetch_or_load(&btc()).await.unwrap();

    h.ingestion.apply(StreamCommand::start(&btc(), "gw", 1)).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;

    assert!(h.connector.push_bar(&btc(), bar(600_000, false)));
    assert!(h.connector.push_bar(&btc(), bar(600_000, true)));
    assert!(h.connector.push_bar(&btc(), bar(660_000, false)));

    let received: Vec<(i64, bool)> = [
        ticks.recv().await.unwrap(),
        ticks.recv().await.unwrap(),
        ticks.recv().await.unwrap(),
    ]
    .iter()
    .map(|t| (t.bar.timestamp, t.bar.closed))
    .collect();
    assert_eq!(received, vec![(600_000, false), (600_000, true), (660_000, false)]);

    let window = h.cache.get_window(&btc()).await.unwrap().unwrap();
    assert_eq!(window.len(), 10);
    assert_eq!(window.last().unwrap().timestamp, 600_000);
    assert!(window.iter().all(|b| b.closed));
}

#[tokio::test(start_paused = true)]
async fn test_open_bar_does_not_touch_window() {
    let h = harness();
    let mut ticks = h.broker.subscribe_ticks(KLINE_PATTERN).await.unwrap();
    h.cache.fetch_or_load(&btc()).await.unwrap();
    let before = h.cache.get_window(&btc()).await.unwrap();

    h.ingestion.apply(StreamCommand::start(&btc(), "gw", 1)).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;
    h.connector.push_bar(&btc(), bar(600_000, false));

    assert!(!ticks.recv().await.unwrap().bar.closed);
    assert_eq!(h.cache.get_window(&btc()).await.unwrap(), before);
}

#[tokio::test(start_paused = true)]
async fn test_activation_loads_window_before_reading() {
    let h = harness();
    assert_eq!(h.cache.get_window(&btc()).await.unwrap(), None);

    h.ingestion.apply(StreamCommand::start(&btc(), "gw", 1)).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;
    assert_eq!(h.cache.loads(), 1);

    let mut ticks = h.broker.subscribe_ticks(KLINE_PATTERN).await.unwrap();
    h.connector.push_bar(&btc(), bar(600_000, true));
    assert!(ticks.recv().await.unwrap().bar.closed);

    let window = h.cache.get_window(&btc()).await.unwrap().unwrap();
    assert_eq!(window.len(), 10);
    assert_eq!(window.last().unwrap().timestamp, 600_000);
    assert_eq!(window[0].timestamp, 60_000);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_reuses_cached_window() {
    let h = harness();
    h.ingestion.apply(StreamCommand::start(&btc(), "gw", 1)).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;

    h.connector.fail(&btc());
    tokio::time::sleep(BACKOFF + Duration::from_millis(10)).await;
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;
    assert_eq!(h.connector.connects(&btc()), 2);
    assert_eq!(h.cache.loads(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_inconsistent_bar_is_dropped() {
    let h = harness();
    let mut ticks = h.broker.subscribe_ticks(KLINE_PATTERN).await.unwrap();
    h.ingestion.apply(StreamCommand::start(&btc(), "gw", 1)).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;

    let mut broken = bar(600_000, true);
    broken.high = Decimal::ZERO;
    h.connector.push_bar(&btc(), broken);
    h.connector.push_bar(&btc(), bar(660_000, true));

    assert_eq!(ticks.recv().await.unwrap().bar.timestamp, 660_000);
    let stats = h.ingestion.stats().snapshot();
    assert_eq!(stats.invalid_bars, 1);
    assert_eq!(stats.ticks_received, 2);
    let window = h.cache.get_window(&btc()).await.unwrap().unwrap();
    assert!(window.iter().all(|b| b.timestamp != 600_000));
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_counts_live_connections() {
    let h = harness();
    let eth = StreamKey::parse("ETHUSDT", "5m").unwrap();
    h.ingestion.apply(StreamCommand::start(&btc(), "gw", 1)).await.unwrap();
    h.ingestion.apply(StreamCommand::start(&eth, "gw", 2)).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;
    wait_for_state(&h, &eth, Some(ConnectionState::Open)).await;
    assert_eq!(h.ingestion.snapshot().await.unwrap().live_connections, 2);

    h.connector.fail(&eth);
    wait_for_state(&h, &eth, Some(ConnectionState::Faulted)).await;
    let snapshot = h.ingestion.snapshot().await.unwrap();
    assert_eq!(snapshot.streams.len(), 2);
    assert_eq!(snapshot.live_connections, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fault_with_demand_reconnects_after_backoff() {
    let h = harness();
    h.ingestion.apply(StreamCommand::start(&btc(), "gw", 1)).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;

    assert!(h.connector.fail(&btc()));
    wait_for_state(&h, &btc(), Some(ConnectionState::Faulted)).await;
    assert_eq!(h.ingestion.snapshot().await.unwrap().pending_reconnects, 1);
    assert_eq!(h.connector.connects(&btc()), 1);

    tokio::time::sleep(BACKOFF + Duration::from_millis(10)).await;
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;
    assert_eq!(h.connector.connects(&btc()), 2);
    assert_eq!(h.connector.open_feeds(&btc()), 1);
    assert_eq!(h.ingestion.stats().snapshot().reconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_peer_close_is_a_fault() {
    let h = harness();
    h.ingestion.apply(StreamCommand::start(&btc(), "gw", 1)).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;

    assert!(h.connector.close_from_peer(&btc()));
    wait_for_state(&h, &btc(), Some(ConnectionState::Faulted)).await;
}

#[tokio::test(start_paused = true)]
async fn test_demand_gone_cancels_pending_reconnect() {
    let h = harness();
    h.ingestion.apply(StreamCommand::start(&btc(), "gw", 1)).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;

    h.connector.fail(&btc());
    wait_for_state(&h, &btc(), Some(ConnectionState::Faulted)).await;
    h.ingestion.apply(StreamCommand::stop(&btc(), "gw", 2)).await.unwrap();

    let snapshot = h.ingestion.snapshot().await.unwrap();
    assert_eq!(snapshot.state_of(&btc()), None);
    assert_eq!(snapshot.pending_reconnects, 0);

    tokio::time::sleep(BACKOFF * 3).await;
    assert_eq!(h.connector.connects(&btc()), 1);
    assert_eq!(h.connector.total_open_feeds(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fault_without_demand_stays_closed() {
    let h = harness();
    h.ingestion.ensure_stream(btc()).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;

    h.connector.fail(&btc());
    wait_for_state(&h, &btc(), None).await;
    tokio::time::sleep(BACKOFF * 2).await;
    assert_eq!(h.connector.connects(&btc()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_demand_to_zero_closes_connection() {
    let h = harness();
    h.ingestion.apply(StreamCommand::start(&btc(), "gw-a", 1)).await.unwrap();
    h.ingestion.apply(StreamCommand::start(&btc(), "gw-b", 1)).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;

    h.ingestion.apply(StreamCommand::stop(&btc(), "gw-a", 2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state(&h, &btc()).await, Some(ConnectionState::Open));

    h.ingestion.apply(StreamCommand::stop(&btc(), "gw-b", 2)).await.unwrap();
    wait_for_state(&h, &btc(), None).await;
    assert_eq!(h.connector.open_feeds(&btc()), 0);
    assert_eq!(h.connector.connects(&btc()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_faults_and_retries() {
    let h = harness();
    h.connector.set_hanging(&btc(), true);
    h.ingestion.apply(StreamCommand::start(&btc(), "gw", 1)).await.unwrap();

    wait_for_state(&h, &btc(), Some(ConnectionState::Faulted)).await;
    h.connector.set_hanging(&btc(), false);

    tokio::time::sleep(BACKOFF + Duration::from_millis(10)).await;
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;
    assert_eq!(h.connector.connects(&btc()), 2);
}

#[tokio::test(start_paused = true)]
async fn test_release_while_connecting() {
    let h = harness();
    h.connector.set_hanging(&btc(), true);
    h.ingestion.apply(StreamCommand::start(&btc(), "gw", 1)).await.unwrap();
    assert_eq!(state(&h, &btc()).await, Some(ConnectionState::Connecting));

    h.ingestion.apply(StreamCommand::stop(&btc(), "gw", 2)).await.unwrap();
    wait_for_state(&h, &btc(), None).await;
    assert_eq!(h.ingestion.snapshot().await.unwrap().pending_reconnects, 0);
}

#[tokio::test(start_paused = true)]
async fn test_restart_while_closing_reopens_once() {
    let h = harness();
    h.ingestion.apply(StreamCommand::start(&btc(), "gw", 1)).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;

    h.ingestion.apply(StreamCommand::stop(&btc(), "gw", 2)).await.unwrap();
    h.ingestion.apply(StreamCommand::start(&btc(), "gw", 3)).await.unwrap();

    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.connector.open_feeds(&btc()), 1);
    assert_eq!(h.connector.connects(&btc()), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reset_releases_a_crashed_gateway() {
    let h = harness();
    h.ingestion.apply(StreamCommand::start(&btc(), "gw", 10)).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;

    h.ingestion.apply(StreamCommand::reset("gw", 11)).await.unwrap();
    wait_for_state(&h, &btc(), None).await;
    assert_eq!(h.connector.total_open_feeds(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_everything() {
    let h = harness();
    let eth = StreamKey::parse("ETHUSDT", "5m").unwrap();
    h.ingestion.apply(StreamCommand::start(&btc(), "gw", 1)).await.unwrap();
    h.ingestion.apply(StreamCommand::start(&eth, "gw", 2)).await.unwrap();
    wait_for_state(&h, &eth, Some(ConnectionState::Open)).await;

    h.ingestion.shutdown().await.unwrap();
    assert_eq!(h.connector.total_open_feeds(), 0);
    assert!(h.ingestion.snapshot().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_control_loop_applies_and_acks() {
    let h = harness();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let broker: Arc<dyn Broker> = h.broker.clone();
    let control = tokio::spawn(run_control_loop(
        broker,
        h.ingestion.clone(),
        Duration::from_millis(100),
        shutdown_rx,
    ));

    h.broker.send_command(&StreamCommand::start(&btc(), "gw", 1)).await.unwrap();
    // Redelivery of the same command.
    h.broker.send_command(&StreamCommand::start(&btc(), "gw", 1)).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;

    h.broker.send_command(&StreamCommand::stop(&btc(), "gw", 2)).await.unwrap();
    wait_for_state(&h, &btc(), None).await;

    assert_eq!(h.connector.connects(&btc()), 1);
    assert_eq!(h.broker.pending_commands(), 0);
    let stats = h.ingestion.stats().snapshot();
    assert_eq!(stats.commands_applied, 2);
    assert_eq!(stats.commands_stale, 1);

    shutdown_tx.send(()).unwrap();
    control.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_control_loop_survives_broker_outage() {
    let h = harness();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let broker: Arc<dyn Broker> = h.broker.clone();
    h.broker.set_available(false);
    let control = tokio::spawn(run_control_loop(
        broker,
        h.ingestion.clone(),
        Duration::from_millis(100),
        shutdown_rx,
    ));

    tokio::time::sleep(Duration::from_millis(350)).await;
    h.broker.set_available(true);
    h.broker.send_command(&StreamCommand::start(&btc(), "gw", 1)).await.unwrap();
    wait_for_state(&h, &btc(), Some(ConnectionState::Open)).await;

    shutdown_tx.send(()).unwrap();
    control.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_announcement_retried_until_broker_returns() {
    let h = harness();
    let mut announcements = h.broker.subscribe_announcements().await.unwrap();
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    h.broker.set_available(false);

    let broker: Arc<dyn Broker> = h.broker.clone();
    let announce = tokio::spawn(announce_presence(
        broker,
        CollectorAnnouncement::new("collector-test", 7),
        Duration::from_millis(100),
        shutdown_rx,
    ));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!announce.is_finished());
    h.broker.set_available(true);

    assert!(announce.await.unwrap());
    let received = announcements.recv().await.unwrap();
    assert_eq!(received.instance, "collector-test");
    assert_eq!(received.started_at, 7);
}

#[tokio::test(start_paused = true)]
async fn test_announcement_abandoned_on_shutdown() {
    let h = harness();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    h.broker.set_available(false);

    let broker: Arc<dyn Broker> = h.broker.clone();
    let announce = tokio::spawn(announce_presence(
        broker,
        CollectorAnnouncement::new("collector-test", 7),
        Duration::from_millis(100),
        shutdown_rx,
    ));
    tokio::time::sleep(Duration::from_millis(150)).await;
    shutdown_tx.send(()).unwrap();
    assert!(!announce.await.unwrap());
}
