use std::sync::Arc;

use anyhow::Context;
use bus::{Broker, RedisBroker, RedisBrokerConfig};
use gateway::config::GatewayConfig;
use gateway::control::ControlPublisher;
use gateway::delivery::DeliveryGateway;
use gateway::fanout::{run_presence_listener, run_tick_consumer};
use gateway::router::create_router;
use gateway::state::AppState;
use gateway::stats::run_stats_logger;
use rolling_cache::{BinanceRestLoader, RedisStore, RollingCacheManager};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GatewayConfig::from_env();
    tracing::info!(
        version = gateway::SERVICE_VERSION,
        gateway_id = %config.gateway_id,
        "Starting gateway"
    );

    let broker = connect_broker(&config).await;
    let store = connect_store(&config).await;
    let loader = BinanceRestLoader::new(config.rest_url.clone(), config.window.load_timeout)
        .context("building history loader")?;
    let cache = Arc::new(RollingCacheManager::new(
        Arc::new(store),
        Arc::new(loader),
        config.window.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (control, control_task) = ControlPublisher::spawn(
        broker.clone(),
        config.gateway_id.clone(),
        config.broker_retry,
        shutdown_tx.subscribe(),
    );
    let (gateway, actor) = DeliveryGateway::spawn(cache.clone(), control.clone(), config.session.clone());

    // Release whatever a previous run of this gateway left registered.
    gateway.resync().context("sending reset")?;

    let consumer = tokio::spawn(run_tick_consumer(
        broker.clone(),
        gateway.clone(),
        config.broker_retry,
        shutdown_tx.subscribe(),
    ));
    // A collector that restarts announces itself; answer with our demand.
    let presence = tokio::spawn(run_presence_listener(
        broker.clone(),
        gateway.clone(),
        config.broker_retry,
        shutdown_tx.subscribe(),
    ));
    let stats = tokio::spawn(run_stats_logger(
        gateway.clone(),
        config.stats_interval,
        shutdown_tx.subscribe(),
    ));

    let state = AppState::new(gateway.clone(), control.clone(), cache, broker, config.clone());
    let app = create_router(state);

    let listener = TcpListener::bind(config.bind).await?;
    tracing::info!("Listening on {}", config.bind);

    let mut server_shutdown = shutdown_tx.subscribe();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.recv().await;
            })
            .await
    });

    shutdown_signal().await;
    tracing::info!("Shutting down gateway");

    // Closing every session queues the matching stop commands.
    if let Err(e) = gateway.shutdown().await {
        tracing::warn!(error = %e, "Delivery actor already stopped");
    }
    let _ = shutdown_tx.send(());

    server.await.context("server task")??;
    let _ = consumer.await;
    let _ = presence.await;
    let _ = stats.await;
    if let Err(e) = control.close().await {
        tracing::warn!(error = %e, "Control publisher already stopped");
    }
    let _ = control_task.await;
    let _ = actor.await;

    tracing::info!("Gateway stopped");
    Ok(())
}

/// Retry until Redis answers; without the broker there is no live data.
async fn connect_broker(config: &GatewayConfig) -> Arc<dyn Broker> {
    let broker_config = RedisBrokerConfig {
        url: config.redis_url.clone(),
        ..RedisBrokerConfig::default()
    };
    loop {
        match RedisBroker::connect(broker_config.clone()).await {
            Ok(broker) => return Arc::new(broker),
            Err(e) => {
                tracing::error!(error = %e, "Broker connection failed, retrying");
                tokio::time::sleep(config.broker_retry).await;
            }
        }
    }
}

async fn connect_store(config: &GatewayConfig) -> RedisStore {
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
