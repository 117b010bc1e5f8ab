//! Delivery Gateway scenarios
//!
//! Sessions are driven through the actor's handle and observed through their
//! outboxes; the broker and cache are in-memory.
//! - snapshot before acknowledgment, failures reported but subscription kept
//! - one start per stream however many sessions subscribe, one stop when the
//!   last one leaves
//! - ticks only reach sessions subscribed to that exact stream, in order
//! - lagging sessions are disconnected through the normal path
//! - a collector announcement is answered with reset and a start per stream

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use bus::{Broker, CollectorAnnouncement};
use common::*;
use gateway::session::{DropPolicy, SessionConfig};
use types::command::StreamCommand;

#[tokio::test]
async fn test_subscribe_serves_snapshot_then_ack() {
    let h = harness().await;
    let a = h.client().await;

    h.gateway.subscribe(a.id, btc_1m()).unwrap();

    let snapshot = a.event().await;
    assert_eq!(snapshot["type"], "historical_data");
    assert_eq!(snapshot["instrument"], "BTCUSDT");
    assert_eq!(snapshot["interval"], "1m");
    assert_eq!(snapshot["bars"].as_array().unwrap().len(), 50);

    let ack = a.event().await;
    assert_eq!(ack["type"], "subscribed");
    assert_eq!(ack["instrument"], "BTCUSDT");

    let commands = h.commands().await;
    assert_eq!(commands.len(), 1);
    assert!(matches!(
        &commands[0],
        StreamCommand::Start { origin, .. } if origin == GATEWAY_ID
    ));
    assert_eq!(commands[0].stream_key(), Some(btc_1m()));
}

#[tokio::test]
async fn test_two_sessions_share_one_start_and_both_get_ticks() {
    let h = harness().await;
    let (a, b) = (h.client().await, h.client().await);

    h.gateway.subscribe(a.id, btc_1m()).unwrap();
    h.gateway.subscribe(b.id, btc_1m()).unwrap();
    a.expect_subscribed().await;
    b.expect_subscribed().await;

    assert_eq!(actions(&h.commands().await), vec!["start"]);
    // Both snapshots came from one loader call.
    assert_eq!(h.loader.calls.load(Ordering::SeqCst), 1);

    h.publish(&btc_1m(), bar(3_000_000, true)).await;
    for client in [&a, &b] {
        let update = client.event().await;
        assert_eq!(update["type"], "kline_update");
        assert_eq!(update["bar"]["timestamp"], 3_000_000);
        assert_eq!(update["bar"]["closed"], true);
    }
}

#[tokio::test]
async fn test_one_unsubscribe_keeps_stream_for_the_other() {
    let h = harness().await;
    let (a, b) = (h.client().await, h.client().await);
    h.gateway.subscribe(a.id, btc_1m()).unwrap();
    h.gateway.subscribe(b.id, btc_1m()).unwrap();
    a.expect_subscribed().await;
    b.expect_subscribed().await;

    h.gateway.unsubscribe(a.id, btc_1m()).unwrap();
    assert_eq!(a.event().await["type"], "unsubscribed");
    assert_eq!(actions(&h.commands().await), vec!["start"]);

    h.publish(&btc_1m(), bar(3_000_000, true)).await;
    assert_eq!(b.event().await["type"], "kline_update");
    assert!(a.maybe_event().await.is_none());

    let snapshot = h.gateway.snapshot().await.unwrap();
    assert_eq!(snapshot.count_of("BTCUSDT:1m"), 1);
}

#[tokio::test]
async fn test_both_disconnect_sends_exactly_one_stop() {
    let h = harness().await;
    let (a, b) = (h.client().await, h.client().await);
    h.gateway.subscribe(a.id, btc_1m()).unwrap();
    h.gateway.subscribe(b.id, btc_1m()).unwrap();
    a.expect_subscribed().await;
    b.expect_subscribed().await;

    h.gateway.disconnect(a.id).unwrap();
    assert_eq!(actions(&h.commands().await), vec!["start"]);
    h.gateway.disconnect(b.id).unwrap();
    // A second disconnect for the same session changes nothing.
    h.gateway.disconnect(b.id).unwrap();

    let commands = h.commands().await;
    assert_eq!(actions(&commands), vec!["start", "stop"]);
    assert_eq!(commands[1].stream_key(), Some(btc_1m()));
    assert!(commands[0].seq() < commands[1].seq());

    assert!(a.outbox.is_closed());
    assert_eq!(a.outbox.next().await, None);

    let snapshot = h.gateway.snapshot().await.unwrap();
    assert_eq!(snapshot.total_clients, 0);
    assert_eq!(snapshot.total_subscription_groups, 0);
}

#[tokio::test]
async fn test_ticks_filtered_by_interval() {
    let h = harness().await;
    let (a, b) = (h.client().await, h.client().await);
    h.gateway.subscribe(a.id, key("BTCUSDT", "5m")).unwrap();
    h.gateway.subscribe(b.id, btc_1m()).unwrap();
    a.expect_subscribed().await;
    b.expect_subscribed().await;

    h.publish(&btc_1m(), bar(3_000_000, false)).await;
    h.publish(&key("ETHUSDT", "5m"), bar(3_000_000, false)).await;

    let update = b.event().await;
    assert_eq!(update["interval"], "1m");
    assert!(a.maybe_event().await.is_none());
    assert!(b.maybe_event().await.is_none());
}

#[tokio::test]
async fn test_open_tick_delivered_live() {
    let h = harness().await;
    let a = h.client().await;
    h.gateway.subscribe(a.id, btc_1m()).unwrap();
    a.expect_subscribed().await;

    h.publish(&btc_1m(), bar(3_000_000, false)).await;
    let update = a.event().await;
    assert_eq!(update["bar"]["closed"], false);

    // The gateway never writes the window.
    let window = h.cache.get_window(&btc_1m()).await.unwrap().unwrap();
    assert_eq!(window.len(), 50);
}

#[tokio::test]
async fn test_ticks_for_one_stream_arrive_in_order() {
    let h = harness().await;
    let a = h.client().await;
    h.gateway.subscribe(a.id, btc_1m()).unwrap();
    a.expect_subscribed().await;

    for i in 0..20 {
        h.publish(&btc_1m(), bar(3_000_000 + i * 60_000, i % 2 == 0)).await;
    }
    for i in 0..20 {
        assert_eq!(a.event().await["bar"]["timestamp"], 3_000_000 + i * 60_000);
    }
}

#[tokio::test]
async fn test_snapshot_failure_reported_and_subscription_kept() {
    let h = harness().await;
    h.loader.fail.store(true, Ordering::SeqCst);
    let a = h.client().await;

    h.gateway.subscribe(a.id, btc_1m()).unwrap();
    let error = a.event().await;
    assert_eq!(error["type"], "error");
    assert!(error["message"].as_str().unwrap().contains("BTCUSDT:1m"));
    assert_eq!(a.event().await["type"], "subscribed");

    h.publish(&btc_1m(), bar(3_000_000, true)).await;
    assert_eq!(a.event().await["type"], "kline_update");
    assert_eq!(h.gateway.stats().counters().snapshot_failures, 1);

    // Nothing was cached, so the next subscriber retries the loader.
    h.loader.fail.store(false, Ordering::SeqCst);
    let b = h.client().await;
    h.gateway.subscribe(b.id, btc_1m()).unwrap();
    assert_eq!(b.expect_subscribed().await["type"], "historical_data");
    assert_eq!(h.loader.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_duplicate_unsubscribe_never_goes_negative() {
    let h = harness().await;
    let (a, b) = (h.client().await, h.client().await);
    h.gateway.subscribe(a.id, btc_1m()).unwrap();
    a.expect_subscribed().await;

    h.gateway.unsubscribe(a.id, btc_1m()).unwrap();
    h.gateway.unsubscribe(a.id, btc_1m()).unwrap();
    // Unsubscribing something never subscribed is still acknowledged.
    h.gateway.unsubscribe(a.id, key("ETHUSDT", "1h")).unwrap();
    for _ in 0..3 {
        assert_eq!(a.event().await["type"], "unsubscribed");
    }

    h.gateway.subscribe(b.id, btc_1m()).unwrap();
    b.expect_subscribed().await;
    assert_eq!(actions(&h.commands().await), vec!["start", "stop", "start"]);
    assert_eq!(h.gateway.snapshot().await.unwrap().count_of("BTCUSDT:1m"), 1);
}

#[tokio::test]
async fn test_repeated_subscribe_counts_once() {
    let h = harness().await;
    let a = h.client().await;
    for _ in 0..3 {
        h.gateway.subscribe(a.id, btc_1m()).unwrap();
    }
    // The last request wins; earlier snapshots are superseded.
    a.expect_subscribed().await;
    while a.maybe_event().await.is_some() {}

    h.gateway.unsubscribe(a.id, btc_1m()).unwrap();
    assert_eq!(actions(&h.commands().await), vec!["start", "stop"]);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_discards_pending_snapshot() {
    let h = harness().await;
    h.loader.delay_ms.store(1_000, Ordering::SeqCst);
    let a = h.client().await;

    h.gateway.subscribe(a.id, btc_1m()).unwrap();
    h.gateway.unsubscribe(a.id, btc_1m()).unwrap();
    assert_eq!(a.event().await["type"], "unsubscribed");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(a.maybe_event().await.is_none());
    assert_eq!(h.loader.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_subscription_cap_reports_error() {
    let h = harness_with(
        SessionConfig {
            max_subscriptions: 1,
            ..session_config()
        },
        5,
    )
    .await;
    let a = h.client().await;
    h.gateway.subscribe(a.id, btc_1m()).unwrap();
    a.expect_subscribed().await;

    h.gateway.subscribe(a.id, key("ETHUSDT", "1m")).unwrap();
    let error = a.event().await;
    assert_eq!(error["type"], "error");
    assert!(error["message"].as_str().unwrap().contains("Max subscriptions"));
    assert_eq!(actions(&h.commands().await), vec!["start"]);
}

#[tokio::test]
async fn test_lagging_session_disconnected_and_demand_released() {
    let h = harness_with(
        SessionConfig {
            queue_capacity: 4,
            drop_policy: DropPolicy::Disconnect,
            ..session_config()
        },
        5,
    )
    .await;
    let (slow, fast) = (h.client().await, h.client().await);
    h.gateway.subscribe(slow.id, btc_1m()).unwrap();
    h.gateway.subscribe(fast.id, key("ETHUSDT", "1m")).unwrap();
    fast.expect_subscribed().await;

    // The slow client never drains: snapshot, ack and three ticks overflow it.
    for i in 0..3 {
        h.publish(&btc_1m(), bar(3_000_000 + i * 60_000, false)).await;
    }
    let stats = h.gateway.stats();
    wait_until("lagging disconnect", || stats.counters().lagging_disconnects == 1).await;

    let commands = h.commands().await;
    let stops: Vec<_> = commands.iter().filter(|c| c.action() == "stop").collect();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].stream_key(), Some(btc_1m()));
    assert!(slow.outbox.is_closed());
    assert_eq!(h.gateway.stats().counters().lagging_disconnects, 1);

    // Other sessions are unaffected.
    h.publish(&key("ETHUSDT", "1m"), bar(3_000_000, true)).await;
    assert_eq!(fast.event().await["type"], "kline_update");
    assert_eq!(h.gateway.snapshot().await.unwrap().total_clients, 1);
}

#[tokio::test]
async fn test_drop_oldest_keeps_lagging_session() {
    let h = harness_with(
        SessionConfig {
            queue_capacity: 4,
            drop_policy: DropPolicy::DropOldest,
            ..session_config()
        },
        5,
    )
    .await;
    let a = h.client().await;
    h.gateway.subscribe(a.id, btc_1m()).unwrap();
    let stats = h.gateway.stats();
    wait_until("snapshot", || stats.counters().snapshots_served == 1).await;

    for i in 0..10 {
        h.publish(&btc_1m(), bar(3_000_000 + i * 60_000, false)).await;
    }
    wait_until("ticks", || stats.counters().ticks_received == 10).await;

    assert!(!a.outbox.is_closed());
    assert!(a.outbox.dropped() > 0);
    let mut last = None;
    while let Some(event) = a.maybe_event().await {
        last = Some(event);
    }
    assert_eq!(last.unwrap()["bar"]["timestamp"], 3_000_000 + 9 * 60_000);
}

#[tokio::test]
async fn test_resync_resets_then_restates_demand() {
    let h = harness().await;
    let a = h.client().await;
    h.gateway.subscribe(a.id, btc_1m()).unwrap();
    h.gateway.subscribe(a.id, key("BTCUSDT", "5m")).unwrap();
    h.gateway.resync().unwrap();

    let commands = h.commands().await;
    assert_eq!(actions(&commands), vec!["start", "start", "reset", "start", "start"]);
    assert_eq!(commands[2].origin(), GATEWAY_ID);
    assert_eq!(commands[3].stream_key(), Some(btc_1m()));
    assert_eq!(commands[4].stream_key(), Some(key("BTCUSDT", "5m")));
    assert!(commands.windows(2).all(|w| w[0].seq() < w[1].seq()));
}

#[tokio::test]
async fn test_tick_consumer_resubscribes_after_loss() {
    let h = harness().await;
    let a = h.client().await;
    h.gateway.subscribe(a.id, btc_1m()).unwrap();
    a.expect_subscribed().await;

    h.broker.drop_subscriptions();
    h.wait_for_tick_stream().await;

    h.publish(&btc_1m(), bar(3_000_000, true)).await;
    assert_eq!(a.event().await["type"], "kline_update");
}

#[tokio::test]
async fn test_collector_announcement_restates_demand() {
    let h = harness().await;
    let a = h.client().await;
    h.gateway.subscribe(a.id, btc_1m()).unwrap();
    h.gateway.subscribe(a.id, key("ETHUSDT", "5m")).unwrap();
    assert_eq!(actions(&h.commands().await), vec!["start", "start"]);

    h.broker
        .announce_collector(&CollectorAnnouncement::new("collector-2", 1))
        .await
        .unwrap();
    let stats = h.gateway.stats();
    wait_until("announcement handled", move || stats.counters().resyncs == 1).await;

    let commands = h.commands().await;
    assert_eq!(actions(&commands), vec!["start", "start", "reset", "start", "start"]);
    assert_eq!(commands[2].origin(), GATEWAY_ID);
    let restated: Vec<_> = commands[3..].iter().filter_map(|c| c.stream_key()).collect();
    assert_eq!(restated, vec![btc_1m(), key("ETHUSDT", "5m")]);
}

#[tokio::test]
async fn test_regained_presence_subscription_resyncs() {
    let h = harness().await;
    let a = h.client().await;
    h.gateway.subscribe(a.id, btc_1m()).unwrap();
    a.expect_subscribed().await;

    h.broker.drop_subscriptions();
    h.wait_for_presence().await;
    let stats = h.gateway.stats();
    wait_until("resync after resubscribe", move || stats.counters().resyncs == 1).await;

    let commands = h.commands().await;
    assert_eq!(actions(&commands), vec!["start", "reset", "start"]);
    assert_eq!(commands[2].stream_key(), Some(btc_1m()));
}

#[tokio::test]
async fn test_shutdown_disconnects_sessions_and_releases_demand() {
    let h = harness().await;
    let a = h.client().await;
    h.gateway.subscribe(a.id, btc_1m()).unwrap();
    a.expect_subscribed().await;

    h.gateway.shutdown().await.unwrap();
    h.control.close().await.unwrap();

    assert!(a.outbox.is_closed());
    assert_eq!(actions(&h.broker.command_log()), vec!["start", "stop"]);
    assert!(h.gateway.snapshot().await.is_err());
}
