//! Declarative appliance repository.
//!
//! Desired state (`spec`) is written through [`StateStore::apply`], observed state
//! through [`StateStore::update_status`] with optimistic concurrency on
//! `resource_version`. Every effective write is announced on the watch stream.

use crate::appliance::{Appliance, ApplianceKey, ApplianceSpec};
use async_trait::async_trait;
use tokio::sync::broadcast;

mod memory;

pub use memory::MemoryStore;


/// Store errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("appliance {0} not found")]
    NotFound(ApplianceKey),

    #[error("appliance {key} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        key: ApplianceKey,
        expected: u64,
        actual: u64,
    },

    #[error("store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Change notification emitted after every effective write
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    Created(Appliance),
    SpecChanged(Appliance),
    StatusChanged(Appliance),
    Deleted(ApplianceKey),
}

impl WatchEvent {
    pub fn key(&self) -> &ApplianceKey {
        match self {
            WatchEvent::Created(a) | WatchEvent::SpecChanged(a) | WatchEvent::StatusChanged(a) => &a.key,
            WatchEvent::Deleted(key) => key,
        }
    }

    /// True for events that change what the appliance should look like
    pub fn changes_desired_state(&self) -> bool {
        matches!(self, WatchEvent::Created(_) | WatchEvent::SpecChanged(_))
    }
}

/// Appliance repository
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &ApplianceKey) -> Result<Appliance, StoreError>;

    /// All appliances, optionally restricted to one namespace, ordered by key
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Appliance>, StoreError>;

    /// Create the appliance or replace its desired state
    async fn apply(&self, key: &ApplianceKey, spec: ApplianceSpec) -> Result<Appliance, StoreError>;

    /// Write `appliance.status`, provided `appliance.resource_version` is still current
    async fn update_status(&self, appliance: &Appliance) -> Result<Appliance, StoreError>;

    async fn delete(&self, key: &ApplianceKey) -> Result<Appliance, StoreError>;

    /// Subscribe to change events from now on
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
