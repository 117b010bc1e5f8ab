use std::sync::Arc;

use anyhow::Context;
use bus::{Broker, CollectorAnnouncement, RedisBroker, RedisBrokerConfig};
use collector::config::CollectorConfig;
use collector::control::{announce_presence, run_control_loop};
use collector::ingestion::{IngestionConfig, IngestionManager};
use collector::stats::run_stats_logger;
use collector::upstream::BinanceKlineConnector;
use rolling_cache::{BinanceRestLoader, RedisStore, RollingCacheManager};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CollectorConfig::from_env();
    tracing::info!(version = collector::SERVICE_VERSION, ws_url = %config.ws_url, "Starting collector");

    let broker = connect_broker(&config).await;
    let store = connect_store(&config).await;
    let loader = BinanceRestLoader::new(config.rest_url.clone(), config.window.load_timeout)
        .context("building history loader")?;
    let cache = Arc::new(RollingCacheManager::new(
        Arc::new(store),
        Arc::new(loader),
        config.window.clone(),
    ));

    let (ingestion, actor) = IngestionManager::spawn(
        Arc::new(BinanceKlineConnector::new(config.ws_url.clone())),
        cache,
        broker.clone(),
        IngestionConfig {
            connect_timeout: config.connect_timeout,
            reconnect_backoff: config.reconnect_backoff,
        },
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let control = tokio::spawn(run_control_loop(
        broker.clone(),
        ingestion.clone(),
        config.broker_retry,
        shutdown_tx.subscribe(),
    ));
    // Ask every gateway to restate its demand; this process starts with none.
    let announcement = CollectorAnnouncement::new(config.collector_id.clone(), chrono::Utc::now().timestamp_millis());
    let announce = tokio::spawn(announce_presence(
        broker,
        announcement,
        config.broker_retry,
        shutdown_tx.subscribe(),
    ));
    let stats = tokio::spawn(run_stats_logger(
        ingestion.clone(),
        config.stats_interval,
        shutdown_tx.subscribe(),
    ));

    shutdown_signal().await;
    tracing::info!("Shutting down collector");
    let _ = shutdown_tx.send(());
    let _ = control.await;
    let _ = announce.await;
    let _ = stats.await;

    ingestion.shutdown().await.context("releasing upstream connections")?;
    let _ = actor.await;
    tracing::info!("Collector stopped");
    Ok(())
}

/// Retry until Redis answers, then requeue anything a previous run left
/// un-acknowledged.
async fn connect_broker(config: &CollectorConfig) -> Arc<dyn Broker> {
    let broker_config = RedisBrokerConfig {
        url: config.redis_url.clone(),
        ..RedisBrokerConfig::default()
    };
    loop {
        match RedisBroker::connect(broker_config.clone()).await {
            Ok(broker) => {
                if let Err(e) = broker.recover_unacked().await {
                    tracing::warn!(error = %e, "Could not requeue un-acknowledged commands");
                }
                return Arc::new(broker);
            }
            Err(e) => {
                tracing::error!(error = %e, "Broker connection failed, retrying");
                tokio::time::sleep(config.broker_retry).await;
            }
        }
    }
}

async fn connect_store(config: &CollectorConfig) -> RedisStore {
    loop {
        match RedisStore::connect(&config.redis_url).await {
            Ok(store) => return store,
            Err(e) => {
                tracing::error!(error = %e, "Cache store connection failed, retrying");
                tokio::time::sleep(config.broker_retry).await;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
