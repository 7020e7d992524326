//! Event bridge: device reports in, reconcile triggers out.
//!
//! One loop consumes the inbound queue strictly in order. Each message is resolved to
//! an appliance, decoded, and compared with the appliance's recorded observed power;
//! only a difference produces a trigger. Messages that cannot be interpreted, or that
//! report an undeclared appliance, are left unacknowledged.

use crate::appliance::ApplianceKey;
use crate::controller::{Trigger, TriggerSource};
use crate::store::{StateStore, StoreError};
use crate::topic::TopicLayout;
use crate::transport::{InboundMessage, InboundReceiver};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

mod metrics;

pub use metrics::{BridgeMetrics, BridgeMetricsSnapshot};


/// Payload that is not a JSON boolean
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("payload is not a boolean: {0}")]
pub struct DecodeError(String);

/// Decode a power report: a JSON boolean literal, surrounding whitespace allowed
pub fn decode_power(payload: &[u8]) -> Result<bool, DecodeError> {
    serde_json::from_slice::<bool>(payload).map_err(|e| DecodeError(e.to_string()))
}

/// How a single inbound message was handled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Reported state differs from the record; trigger sent, message acked
    Triggered,
    /// Reported state matches the record; message acked
    Suppressed,
    /// Topic does not address an appliance; not acked
    UnknownTopic,
    /// Payload is not a boolean; not acked
    InvalidPayload,
    /// Appliance is not declared; not acked
    NotFound,
    /// Store lookup failed; not acked
    StoreUnavailable,
    /// Trigger channel is closed; not acked
    ControllerGone,
}

impl BridgeOutcome {
    fn acknowledges(self) -> bool {
        matches!(self, BridgeOutcome::Triggered | BridgeOutcome::Suppressed)
    }
}

pub struct EventBridge {
    store: Arc<dyn StateStore>,
    topics: TopicLayout,
    triggers: mpsc::Sender<Trigger>,
    metrics: Arc<BridgeMetrics>,
}

impl EventBridge {
    pub fn new(
        store: Arc<dyn StateStore>,
        topics: TopicLayout,
        triggers: mpsc::Sender<Trigger>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            store,
            topics,
            triggers,
            metrics,
        }
    }

    /// Consume inbound messages until shutdown or until the queue closes
    pub async fn run(self, mut inbound: InboundReceiver, mut shutdown: watch::Receiver<bool>) {
        info!(pattern = %self.topics.subscription_pattern(), "Event bridge started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let message = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                message = inbound.recv() => message,
            };
            let Some(message) = message else {
                warn!("Inbound queue closed");
                break;
            };

            self.handle(message).await;
        }

        info!("Event bridge stopped");
    }

    /// Process one message, acknowledging it when the outcome is final
    pub async fn handle(&self, message: InboundMessage) -> BridgeOutcome {
        self.metrics.record_received();
        let topic = message.topic.clone();
        let message_id = message.message_id;

        let outcome = self.evaluate(&message).await;
        self.metrics.record_outcome(outcome);

        if outcome.acknowledges() {
            if let Err(e) = message.ack().await {
                self.metrics.record_ack_failure();
                error!(topic = %topic, message_id = ?message_id, error = %e, "Failed to acknowledge message");
            }
        }
        outcome
    }

    async fn evaluate(&self, message: &InboundMessage) -> BridgeOutcome {
        let topic = &message.topic;
        let message_id = message.message_id;

        let key = match self.topics.parse(topic) {
            Ok(key) => key,
            Err(e) => {
                warn!(topic = %topic, message_id = ?message_id, error = %e, "Ignoring message on unexpected topic");
                return BridgeOutcome::UnknownTopic;
            }
        };

        let reported = match decode_power(&message.payload) {
            Ok(power) => power,
            Err(e) => {
                error!(topic = %topic, message_id = ?message_id, error = %e, "Unable to decode power report");
                return BridgeOutcome::InvalidPayload;
            }
        };

        let appliance = match self.store.get(&key).await {
            Ok(appliance) => appliance,
            Err(StoreError::NotFound(_)) => {
                debug!(key = %key, topic = %topic, message_id = ?message_id, "Report for undeclared appliance");
                return BridgeOutcome::NotFound;
            }
            Err(e) => {
                error!(key = %key, topic = %topic, message_id = ?message_id, error = %e, "Unable to load appliance");
                return BridgeOutcome::StoreUnavailable;
            }
        };

        if appliance.status.observed_power == reported {
            debug!(key = %key, message_id = ?message_id, power = reported, "Report matches observed state");
            return BridgeOutcome::Suppressed;
        }

        self.trigger(key, reported, message_id).await
    }

    async fn trigger(&self, key: ApplianceKey, reported: bool, message_id: Option<u64>) -> BridgeOutcome {
        info!(key = %key, message_id = ?message_id, power = reported, "Observed state changed, triggering reconcile");
        match self
            .triggers
            .send(Trigger::new(key, TriggerSource::ObservedChange))
            .await
        {
            Ok(()) => BridgeOutcome::Triggered,
            Err(e) => {
                error!(key = %e.0.key, "Controller is gone, trigger dropped");
                BridgeOutcome::ControllerGone
            }
        }
    }
}
