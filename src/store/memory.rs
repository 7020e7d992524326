use super::{StateStore, StoreError, WatchEvent};
use crate::appliance::{Appliance, ApplianceKey, ApplianceSpec};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

const WATCH_CAPACITY: usize = 1024;

/// In-memory store (DashMap) with a broadcast watch stream
pub struct MemoryStore {
    appliances: DashMap<ApplianceKey, Appliance>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            appliances: DashMap::new(),
            events,
        }
    }

    /// Load records recovered from a snapshot. Existing entries with the same key
    /// are replaced; no watch events are emitted.
    pub fn restore(&self, appliances: Vec<Appliance>) {
        let count = appliances.len();
        for appliance in appliances {
            self.appliances.insert(appliance.key.clone(), appliance);
        }
        info!(appliances = count, "Restored appliances into store");
    }

    /// Point-in-time copy of every record, ordered by key
    pub fn all(&self) -> Vec<Appliance> {
        let mut all: Vec<Appliance> = self
            .appliances
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn len(&self) -> usize {
        self.appliances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.appliances.is_empty()
    }

    fn emit(&self, event: WatchEvent) {
        // No receivers is fine: nobody is watching yet
        let _ = self.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &ApplianceKey) -> Result<Appliance, StoreError> {
        self.appliances
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Appliance>, StoreError> {
        let mut all = self.all();
        if let Some(namespace) = namespace {
            all.retain(|a| a.key.namespace == namespace);
        }
        Ok(all)
    }

    async fn apply(&self, key: &ApplianceKey, spec: ApplianceSpec) -> Result<Appliance, StoreError> {
        let (appliance, created) = match self.appliances.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                let appliance = Appliance::new(key.clone(), spec);
                vacant.insert(appliance.clone());
                (appliance, true)
            }
            Entry::Occupied(mut occupied) => {
                let appliance = occupied.get_mut();
                if appliance.spec == spec {
                    return Ok(appliance.clone());
                }
                appliance.spec = spec;
                appliance.generation += 1;
                appliance.resource_version += 1;
                (appliance.clone(), false)
            }
        };

        debug!(key = %key, power = spec.power, generation = appliance.generation, "Applied desired state");
        self.emit(if created {
            WatchEvent::Created(appliance.clone())
        } else {
            WatchEvent::SpecChanged(appliance.clone())
        });
        Ok(appliance)
    }

    async fn update_status(&self, update: &Appliance) -> Result<Appliance, StoreError> {
        let updated = {
            let mut entry = self
                .appliances
                .get_mut(&update.key)
                .ok_or_else(|| StoreError::NotFound(update.key.clone()))?;
            let current = entry.value_mut();

            if current.resource_version != update.resource_version {
                return Err(StoreError::Conflict {
                    key: update.key.clone(),
                    expected: update.resource_version,
                    actual: current.resource_version,
                });
            }
            if current.status == update.status {
                return Ok(current.clone());
            }

            current.status = update.status.clone();
            current.resource_version += 1;
            current.clone()
        };

        debug!(
            key = %updated.key,
            observed_power = updated.status.observed_power,
            resource_version = updated.resource_version,
            "Updated status"
        );
        self.emit(WatchEvent::StatusChanged(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, key: &ApplianceKey) -> Result<Appliance, StoreError> {
        let (_, removed) = self
            .appliances
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        debug!(key = %key, "Deleted appliance");
        self.emit(WatchEvent::Deleted(key.clone()));
        Ok(removed)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
