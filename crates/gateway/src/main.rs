//! Gateway service entry point.
//!
//! Live-sync server for the shared checkbox grid.

use anyhow::{Context, Result};
use gateway::{create_router, AppState, Config, ConnectionRegistry, FanoutLoop, SyncService};
use grid_store::{CellStore, RedisCellStore, RedisUpdateChannel, UpdateChannel};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting checkbox gateway");

    let config = Config::from_env()?;

    info!("Configuration:");
    info!("  APP_ENV: {}", config.app_env);
    info!("  SERVER_ADDR: {}", config.server_addr);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  GRID: {} x {}", config.grid_rows, config.grid_cols);
    info!("  UPDATES_TOPIC: {}", config.updates_topic);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("Failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    // Connect to Redis
    let store = RedisCellStore::connect(&config.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    store.ping().await.context("Redis is not responding")?;
    info!("Connected to Redis");

    if let Err(e) = store.initialize(config.grid_rows, config.grid_cols).await {
        warn!("Failed to initialize grid states: {}", e);
    }

    let channel = RedisUpdateChannel::connect(&config.redis_url)
        .await
        .context("Failed to open Redis pub/sub connection")?;

    let store: Arc<dyn CellStore> = Arc::new(store);
    let channel: Arc<dyn UpdateChannel> = Arc::new(channel);
    let registry = Arc::new(ConnectionRegistry::new());

    // Start the fanout loop before accepting connections
    let (fanout_shutdown_tx, fanout_shutdown_rx) = mpsc::channel(1);
    let mut fanout_handle = FanoutLoop::new(
        channel.clone(),
        registry.clone(),
        config.updates_topic.clone(),
    )
    .spawn(fanout_shutdown_rx)
    .await?;

    let service = SyncService::new(store, channel, registry, config.sync_config());
    let app = create_router(Arc::new(AppState { service }));

    // Start HTTP server
    let listener = TcpListener::bind(config.server_addr).await?;
    info!("Gateway listening on {}", config.server_addr);

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .into_future();

    tokio::select! {
        result = server => {
            result?;
        }
        result = &mut fanout_handle => {
            // The fanout loop only returns early on a lost subscription
            match result {
                Ok(Ok(())) => anyhow::bail!("Fanout loop stopped unexpectedly"),
                Ok(Err(e)) => {
                    error!("Fanout loop failed: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Fanout task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    // Shutdown fanout loop
    info!("Shutting down fanout loop...");
    let _ = fanout_shutdown_tx.send(()).await;
    let _ = fanout_handle.await;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
