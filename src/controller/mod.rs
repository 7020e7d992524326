//! Trigger mechanism for the reconciler.
//!
//! Two sources feed one work queue: the store watch (appliances created or given a new
//! desired state) and the event bridge (devices reporting a state that differs from
//! the recorded one). Workers pull keys, run the reconciler under a timeout and
//! requeue failures with per-key exponential backoff.

use crate::appliance::ApplianceKey;
use crate::reconciler::{ReconcileError, ReconcileOutcome};
use crate::store::{StateStore, WatchEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

mod metrics;
mod queue;

pub use metrics::{ControllerMetrics, ControllerMetricsSnapshot};
pub use queue::WorkQueue;


/// Why a key was queued
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Created,
    SpecChanged,
    /// A device reported a state different from the recorded one
    ObservedChange,
    Resync,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerSource::Created => "created",
            TriggerSource::SpecChanged => "spec_changed",
            TriggerSource::ObservedChange => "observed_change",
            TriggerSource::Resync => "resync",
        };
        f.write_str(name)
    }
}

/// Request to reconcile one appliance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trigger {
    pub key: ApplianceKey,
    pub source: TriggerSource,
}

impl Trigger {
    pub fn new(key: ApplianceKey, source: TriggerSource) -> Self {
        Self { key, source }
    }
}

/// The unit of work the controller runs per key
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, key: &ApplianceKey) -> Result<ReconcileOutcome, ReconcileError>;
}

/// Controller configuration
#[derive(Clone, Debug, Deserialize)]
pub struct ControllerConfig {
    /// Concurrent reconciles across different keys
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Upper bound on a single reconcile
    #[serde(default = "default_reconcile_timeout_ms")]
    pub reconcile_timeout_ms: u64,

    /// First retry delay after a failure; doubles per consecutive failure
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Queue every stored appliance when the controller starts
    #[serde(default = "default_resync_on_start")]
    pub resync_on_start: bool,

    /// Buffer between the event bridge and the controller
    #[serde(default = "default_trigger_capacity")]
    pub trigger_capacity: usize,
}

fn default_workers() -> usize {
    2
}

fn default_reconcile_timeout_ms() -> u64 {
    10_000
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_resync_on_start() -> bool {
    true
}

fn default_trigger_capacity() -> usize {
    256
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            reconcile_timeout_ms: default_reconcile_timeout_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            resync_on_start: default_resync_on_start(),
            trigger_capacity: default_trigger_capacity(),
        }
    }
}

impl ControllerConfig {
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout_ms)
    }
}

pub struct Controller {
    reconciler: Arc<dyn Reconcile>,
    store: Arc<dyn StateStore>,
    config: ControllerConfig,
    queue: Arc<WorkQueue>,
    metrics: Arc<ControllerMetrics>,
}

impl Controller {
    pub fn new(
        reconciler: Arc<dyn Reconcile>,
        store: Arc<dyn StateStore>,
        config: ControllerConfig,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        ));
        Self {
            reconciler,
            store,
            config,
            queue,
            metrics: Arc::new(ControllerMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<ControllerMetrics> {
        self.metrics.clone()
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Queue a key from any source
    pub fn enqueue(&self, trigger: Trigger) {
        if self.queue.add(trigger.key.clone()) {
            debug!(key = %trigger.key, source = %trigger.source, "Queued reconcile");
        }
    }

    /// Queue every stored appliance
    pub async fn resync(&self) {
        match self.store.list(None).await {
            Ok(appliances) => {
                self.metrics.record_resync();
                info!(appliances = appliances.len(), "Resyncing all appliances");
                for appliance in appliances {
                    self.enqueue(Trigger::new(appliance.key, TriggerSource::Resync));
                }
            }
            Err(e) => error!(error = %e, "Failed to list appliances for resync"),
        }
    }

    /// Run sources and workers until shutdown
    pub async fn run(
        self: Arc<Self>,
        triggers: mpsc::Receiver<Trigger>,
        events: broadcast::Receiver<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            workers = self.config.workers,
            timeout_ms = self.config.reconcile_timeout_ms,
            "Starting controller"
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().pump_triggers(triggers, shutdown.clone()));
        tasks.spawn(self.clone().pump_watch(events, shutdown.clone()));

        if self.config.resync_on_start {
            self.resync().await;
        }

        for worker in 0..self.config.workers.max(1) {
            tasks.spawn(self.clone().work(worker));
        }

        let _ = shutdown.wait_for(|stop| *stop).await;
        info!("Controller shutting down");
        self.queue.shut_down();

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Controller task failed");
            }
        }
        info!("Controller stopped");
    }

    async fn pump_triggers(
        self: Arc<Self>,
        mut triggers: mpsc::Receiver<Trigger>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let trigger = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                trigger = triggers.recv() => trigger,
            };
            let Some(trigger) = trigger else {
                debug!("Trigger channel closed");
                break;
            };
            self.metrics.record_trigger();
            self.enqueue(trigger);
        }
    }

    async fn pump_watch(
        self: Arc<Self>,
        mut events: broadcast::Receiver<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                event = events.recv() => event,
            };
            match event {
                Ok(WatchEvent::Created(appliance)) => {
                    self.metrics.record_watch_event();
                    self.enqueue(Trigger::new(appliance.key, TriggerSource::Created));
                }
                Ok(WatchEvent::SpecChanged(appliance)) => {
                    self.metrics.record_watch_event();
                    self.enqueue(Trigger::new(appliance.key, TriggerSource::SpecChanged));
                }
                // Status writes are our own output; deletes resolve as not-found
                Ok(WatchEvent::StatusChanged(_)) | Ok(WatchEvent::Deleted(_)) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed = missed, "Store watch lagged, resyncing");
                    self.resync().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Store watch closed");
                    break;
                }
            }
        }
    }

    async fn work(self: Arc<Self>, worker: usize) {
        debug!(worker = worker, "Controller worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(worker = worker, "Controller worker stopped");
    }

    /// Run one reconcile for `key` and decide whether to retry it
    pub async fn process(&self, key: &ApplianceKey) {
        self.metrics.record_reconcile();

        let result = tokio::time::timeout(
            self.config.reconcile_timeout(),
            self.reconciler.reconcile(key),
        )
        .await;

        match result {
            Ok(Ok(ReconcileOutcome::Reconciled { observed_power })) => {
                debug!(key = %key, observed_power = observed_power, "Reconcile succeeded");
                self.metrics.record_success();
                self.queue.forget(key);
            }
            Ok(Ok(ReconcileOutcome::NotFound)) => {
                self.metrics.record_not_found();
                self.queue.forget(key);
            }
            Ok(Err(e)) if !e.is_retryable() => {
                error!(key = %key, error = %e, "Reconcile failed permanently, not retrying");
                self.metrics.record_failure();
                self.queue.forget(key);
            }
            Ok(Err(e)) => {
                self.metrics.record_failure();
                self.requeue(key, &e.to_string());
            }
            Err(_) => {
                self.metrics.record_timeout();
                self.requeue(key, "reconcile timed out");
            }
        }
    }

    fn requeue(&self, key: &ApplianceKey, reason: &str) {
        let delay = self.queue.next_retry_delay(key);
        warn!(
            key = %key,
            error = %reason,
            retry_in_ms = delay.as_millis() as u64,
            failures = self.queue.failures(key),
            "Reconcile failed, requeueing"
        );
        self.metrics.record_requeue();
        self.queue.add_after(key.clone(), delay);
    }
}
