mod config;
mod store;
mod store_manager;
mod pipeline;
mod monitor;
mod api;

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::monitor::CycleReport;
use crate::pipeline::Pipeline;
use crate::store::db::RecordStore;
use crate::store_manager::{StoreHandle, StorePool};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("scan_ledgerd=info,shared=info"))
        )
        .init();

    tracing::info!("Starting scan-ledgerd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/scan-ledger/scan-ledgerd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Open one connection per ingestion worker
    let stores = Arc::new(StorePool::open(&config.store.db_path, config.store.connections)?);
    tracing::info!(
        "Opened database at {:?} with {} ingestion connections",
        config.store.db_path,
        stores.len()
    );

    let (report_tx, report_rx) = watch::channel(CycleReport::default());

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // The monitor reads through its own connection, never through the writers
    let monitor_store = if config.monitor.enabled {
        let store = StoreHandle::spawn(RecordStore::open(&config.store.db_path)?);
        let monitor_cancel = cancel.clone();
        let monitor_config = config.monitor.clone();
        let monitor_handle = store.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = monitor::run(monitor_handle, monitor_config, report_tx, monitor_cancel).await {
                tracing::error!("Consistency monitor error: {}", e);
            }
        });
        Some((store, task))
    } else {
        tracing::info!("Consistency monitor disabled");
        None
    };

    // Build API router
    let app_state = api::routes::AppState {
        pipeline: Pipeline::new(stores.clone(), config.ingest.upsert_timeout()),
        stores: stores.clone(),
        report_rx,
        cancel: cancel.clone(),
        snapshot_timeout: config.api.snapshot_timeout(),
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();

    let _ = server_handle.await;
    if let Some((store, task)) = monitor_store {
        let _ = task.await;
        if let Err(e) = store.shutdown().await {
            tracing::error!("Failed to shutdown monitor store: {}", e);
        }
    }

    // Shutdown store threads
    stores.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
