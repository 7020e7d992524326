//! Drives one appliance towards its desired state.
//!
//! A reconcile publishes the desired power value, waits (bounded) for the broker to
//! confirm delivery and then records the outcome as observed state. Publishing is
//! taken as evidence the device will follow; the device's own report arriving through
//! the event bridge corrects the record if it does not.

use crate::appliance::{
    set_status_condition, Appliance, ApplianceKey, Condition, ConditionStatus,
    CONDITION_POWERED_ON, REASON_UPDATED,
};
use crate::controller::Reconcile;
use crate::store::{StateStore, StoreError};
use crate::topic::{TopicError, TopicLayout};
use crate::transport::{PublishOptions, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// Result of a successful reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The appliance no longer exists; nothing to do
    NotFound,
    /// Desired state was published and recorded
    Reconciled { observed_power: bool },
}

/// Reconcile failures; all but `Unaddressable` are retried
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconcileError {
    /// The appliance has no topic of its own under the configured layout
    #[error("appliance cannot be addressed: {0}")]
    Unaddressable(TopicError),

    #[error("transport is not connected")]
    TransportUnavailable,

    #[error("failed to publish desired state: {0}")]
    Publish(TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReconcileError::Unaddressable(_))
    }
}

impl From<TransportError> for ReconcileError {
    fn from(error: TransportError) -> Self {
        if error.is_connection_lost() {
            ReconcileError::TransportUnavailable
        } else {
            ReconcileError::Publish(error)
        }
    }
}

/// Wire encoding of a power value
pub fn encode_power(power: bool) -> Bytes {
    Bytes::from_static(if power { b"true" } else { b"false" })
}

/// Condition message describing the published power state
pub fn power_message(name: &str, power: bool) -> String {
    format!("Appliance {} is powered {}", name, power)
}

pub struct Reconciler {
    store: Arc<dyn StateStore>,
    transport: Arc<dyn Transport>,
    topics: TopicLayout,
    publish: PublishOptions,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn StateStore>,
        transport: Arc<dyn Transport>,
        topics: TopicLayout,
        publish: PublishOptions,
    ) -> Self {
        Self {
            store,
            transport,
            topics,
            publish,
        }
    }

    /// Publish the desired state of `key` and record it as observed
    pub async fn reconcile(&self, key: &ApplianceKey) -> Result<ReconcileOutcome, ReconcileError> {
        let appliance = match self.store.get(key).await {
            Ok(appliance) => appliance,
            Err(StoreError::NotFound(_)) => {
                debug!(key = %key, "Appliance not found, nothing to reconcile");
                return Ok(ReconcileOutcome::NotFound);
            }
            Err(e) => return Err(e.into()),
        };

        let topic = self
            .topics
            .topic_for(key)
            .map_err(ReconcileError::Unaddressable)?;
        let power = appliance.spec.power;

        if !self.transport.connection_state().is_connected() {
            warn!(key = %key, transport = self.transport.name(), "Transport not connected, deferring reconcile");
            return Err(ReconcileError::TransportUnavailable);
        }

        self.transport
            .publish(&topic, encode_power(power), self.publish)
            .await?;
        debug!(key = %key, topic = %topic, power = power, "Published desired state");

        let updated = self.store.update_status(&with_observed_power(appliance)).await?;

        info!(
            key = %key,
            power = power,
            generation = updated.status.observed_generation,
            "Reconciled appliance"
        );
        Ok(ReconcileOutcome::Reconciled {
            observed_power: updated.status.observed_power,
        })
    }
}

#[async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, key: &ApplianceKey) -> Result<ReconcileOutcome, ReconcileError> {
        Reconciler::reconcile(self, key).await
    }
}

/// Status after a confirmed publish of the desired power value
fn with_observed_power(mut appliance: Appliance) -> Appliance {
    let power = appliance.spec.power;
    set_status_condition(
        &mut appliance.status.conditions,
        Condition::new(
            CONDITION_POWERED_ON,
            ConditionStatus::from(power),
            REASON_UPDATED,
            power_message(&appliance.key.name, power),
        ),
    );
    appliance.status.observed_power = power;
    appliance.status.observed_generation = appliance.generation;
    appliance
}
