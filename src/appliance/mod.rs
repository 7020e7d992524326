use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

mod condition;
#[cfg(test)]
mod tests;

pub use condition::{
    find_status_condition, set_status_condition, Condition, ConditionStatus,
    CONDITION_POWERED_ON, REASON_UPDATED,
};

/// Maximum length of a namespace or name segment
pub const MAX_SEGMENT_LEN: usize = 63;

/// Addresses one appliance: `(namespace, name)`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplianceKey {
    pub namespace: String,
    pub name: String,
}

/// Key validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KeyError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} must be at most 63 characters")]
    TooLong(&'static str),
    #[error("{field} contains invalid character '{found}' (must be [a-z0-9-_])")]
    InvalidCharacter { field: &'static str, found: char },
}

impl ApplianceKey {
    /// Build a key without validation (callers that already hold trusted segments)
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build a key, validating both segments
    pub fn parse(namespace: &str, name: &str) -> Result<Self, KeyError> {
        validate_segment("namespace", namespace)?;
        validate_segment("name", name)?;
        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for ApplianceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Validate a namespace or name segment.
///
/// Rules: 1-63 characters, lowercase alphanumeric + dash/underscore. Segments end up
/// verbatim in transport topics, so separators and wildcards are never allowed.
pub fn validate_segment(field: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::Empty(field));
    }
    if value.len() > MAX_SEGMENT_LEN {
        return Err(KeyError::TooLong(field));
    }
    for c in value.chars() {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '_' {
            return Err(KeyError::InvalidCharacter { field, found: c });
        }
    }
    Ok(())
}

/// Desired state, owned by whoever declares the appliance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplianceSpec {
    /// Desired power state
    pub power: bool,
}

/// Observed state, written only by the reconciler
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplianceStatus {
    /// Last power state the operator believes the device reports
    #[serde(rename = "observedPower")]
    pub observed_power: bool,

    /// Generation of the spec that produced this status
    #[serde(rename = "observedGeneration", default)]
    pub observed_generation: i64,

    /// Status conditions keyed by `type`
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// An appliance record as held by the state store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Appliance {
    #[serde(flatten)]
    pub key: ApplianceKey,

    /// Incremented on every desired-spec change
    pub generation: i64,

    /// Incremented on every write; used for optimistic concurrency
    #[serde(rename = "resourceVersion")]
    pub resource_version: u64,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    pub spec: ApplianceSpec,

    #[serde(default)]
    pub status: ApplianceStatus,
}

impl Appliance {
    /// Fresh record for a newly declared appliance
    pub fn new(key: ApplianceKey, spec: ApplianceSpec) -> Self {
        Self {
            key,
            generation: 1,
            resource_version: 1,
            created_at: Utc::now(),
            spec,
            status: ApplianceStatus::default(),
        }
    }

    /// Current `poweredOn` condition, if reconciled at least once
    pub fn powered_on(&self) -> Option<&Condition> {
        find_status_condition(&self.status.conditions, CONDITION_POWERED_ON)
    }
}
