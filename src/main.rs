use anyhow::{Context, Result};
use appliance_operator::api::{create_router, serve};
use appliance_operator::config::load_from_env;
use appliance_operator::operator::Operator;
use appliance_operator::snapshot::{load_latest_snapshot, SnapshotManager};
use appliance_operator::store::MemoryStore;
use appliance_operator::transport;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "appliance_operator=info".into()),
        )
        .init();

    info!("Appliance operator starting...");

    let config = load_from_env().context("Failed to load configuration")?;
    info!(
        transport = ?config.transport.kind,
        url = %config.transport.url(),
        pattern = %config.topics.subscription_pattern(),
        namespace = %config.topics.namespace,
        workers = config.controller.workers,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Restore declared appliances from the newest snapshot
    let store = Arc::new(MemoryStore::new());
    if config.snapshot.enabled {
        match load_latest_snapshot(&config.snapshot.directory) {
            Ok(Some(snapshot)) => store.restore(snapshot.appliances),
            Ok(None) => info!("Starting with an empty store"),
            Err(e) => error!(error = %e, "Failed to read snapshots, starting with an empty store"),
        }
    }

    let transport = transport::connect(&config.transport, shutdown_rx.clone())
        .await
        .context("Failed to start transport")?;

    let operator = Operator::start(&config, store.clone(), transport, shutdown_rx.clone())
        .await
        .context("Failed to start operator")?;

    let snapshot_manager = SnapshotManager::new(store.clone(), config.snapshot.clone());
    let snapshot_shutdown = shutdown_rx.clone();
    let snapshot_handle = tokio::spawn(async move {
        if let Err(e) = snapshot_manager.run_snapshot_loop(snapshot_shutdown).await {
            error!(error = %e, "Snapshot manager failed");
        }
    });

    let router = create_router(operator.api_state());
    let bind = config.api.bind.clone();
    let api_shutdown = shutdown_rx.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = serve(&bind, router, api_shutdown).await {
            error!(error = %e, "HTTP API failed");
        }
    });

    info!("Appliance operator running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    operator.wait().await;
    let _ = api_handle.await;
    let _ = snapshot_handle.await;

    info!("Appliance operator stopped");
    Ok(())
}
