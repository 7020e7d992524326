//! Startup wiring.
//!
//! Owns the inbound queue, subscribes it to the appliance topic pattern, and starts
//! the event bridge and the controller with its two trigger sources.

use crate::api::ApiState;
use crate::bridge::{BridgeMetrics, EventBridge};
use crate::config::OperatorConfig;
use crate::controller::Controller;
use crate::reconciler::Reconciler;
use crate::store::{MemoryStore, StateStore};
use crate::topic::TopicLayout;
use crate::transport::{inbound_queue, ConnectionState, DropCounter, Transport};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub struct Operator {
    store: Arc<MemoryStore>,
    transport: Arc<dyn Transport>,
    controller: Arc<Controller>,
    bridge_metrics: Arc<BridgeMetrics>,
    inbound_dropped: DropCounter,
    topics: TopicLayout,
    tasks: JoinSet<()>,
}

impl Operator {
    /// Subscribe, then start the bridge and the controller
    pub async fn start(
        config: &OperatorConfig,
        store: Arc<MemoryStore>,
        transport: Arc<dyn Transport>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let topics = config.topics.clone();
        let pattern = topics.subscription_pattern();

        // The transport owns the only sender, so the bridge sees the queue close with it
        let (inbound, inbound_rx) = inbound_queue(&config.bridge);
        let inbound_dropped = inbound.drop_counter();
        transport
            .subscribe(&pattern, config.transport.qos, inbound)
            .await
            .with_context(|| format!("Failed to subscribe to '{}'", pattern))?;
        info!(pattern = %pattern, transport = transport.name(), "Subscribed to appliance reports");

        let mut tasks = JoinSet::new();

        let (trigger_tx, trigger_rx) = mpsc::channel(config.controller.trigger_capacity.max(1));
        let bridge_metrics = Arc::new(BridgeMetrics::default());
        let bridge = EventBridge::new(
            store.clone(),
            topics.clone(),
            trigger_tx,
            bridge_metrics.clone(),
        );
        tasks.spawn(bridge.run(inbound_rx, shutdown.clone()));

        let reconciler = Reconciler::new(
            store.clone(),
            transport.clone(),
            topics.clone(),
            config.transport.publish_options(),
        );
        let controller = Arc::new(Controller::new(
            Arc::new(reconciler),
            store.clone(),
            config.controller.clone(),
        ));
        // Subscribe to the store before the controller task runs so no write is missed
        let events = store.watch();
        tasks.spawn(controller.clone().run(trigger_rx, events, shutdown.clone()));

        tasks.spawn(log_connection_changes(transport.clone(), shutdown));

        Ok(Self {
            store,
            transport,
            controller,
            bridge_metrics,
            inbound_dropped,
            topics,
            tasks,
        })
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    pub fn controller(&self) -> Arc<Controller> {
        self.controller.clone()
    }

    pub fn bridge_metrics(&self) -> Arc<BridgeMetrics> {
        self.bridge_metrics.clone()
    }

    /// State for the HTTP API
    pub fn api_state(&self) -> Arc<ApiState> {
        let store: Arc<dyn StateStore> = self.store.clone();
        Arc::new(ApiState {
            store,
            transport: self.transport.clone(),
            bridge_metrics: self.bridge_metrics.clone(),
            controller_metrics: self.controller.metrics(),
            queue: self.controller.queue(),
            inbound_dropped: self.inbound_dropped.clone(),
            topics: self.topics.clone(),
        })
    }

    /// Wait for the bridge, controller and watchers to stop (after shutdown)
    pub async fn wait(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Operator task failed");
            }
        }
        info!("Operator stopped");
    }
}

async fn log_connection_changes(transport: Arc<dyn Transport>, mut shutdown: watch::Receiver<bool>) {
    let mut states = transport.watch_connection();
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                match &state {
                    ConnectionState::Connected => info!(transport = transport.name(), "Transport connected"),
                    ConnectionState::Closed => {
                        info!(transport = transport.name(), "Transport closed");
                        break;
                    }
                    other => warn!(transport = transport.name(), state = ?other, "Transport not connected"),
                }
            }
        }
    }
}
