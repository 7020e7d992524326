//! HTTP API: declare appliances, read their status, check operator health.

use crate::bridge::BridgeMetrics;
use crate::controller::{ControllerMetrics, WorkQueue};
use crate::store::StateStore;
use crate::topic::TopicLayout;
use crate::transport::{DropCounter, Transport};
use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

pub mod appliances;
pub mod health;

pub use appliances::create_appliance_router;
pub use health::create_health_router;

/// Shared state for every API route
pub struct ApiState {
    pub store: Arc<dyn StateStore>,
    pub transport: Arc<dyn Transport>,
    pub bridge_metrics: Arc<BridgeMetrics>,
    pub controller_metrics: Arc<ControllerMetrics>,
    pub queue: Arc<WorkQueue>,
    /// Messages refused by the inbound queue
    pub inbound_dropped: DropCounter,
    /// Layout used to reject appliances no topic can address
    pub topics: TopicLayout,
}

/// Full API router with permissive CORS
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .merge(create_appliance_router(state.clone()))
        .merge(create_health_router(state))
        .layer(CorsLayer::permissive())
}

/// Serve `router` on `bind` until shutdown
pub async fn serve(bind: &str, router: Router, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind HTTP API to {}", bind))?;
    info!(bind = %bind, "HTTP API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("HTTP API server failed")?;

    info!("HTTP API stopped");
    Ok(())
}
