//! Transport topic layout.
//!
//! Appliances are addressed on the transport as
//! `<prefix>/<name>/<attribute>`, or `<prefix>/<namespace>/<name>/<attribute>` when
//! namespaced topics are enabled. Without the namespace segment every inbound topic
//! resolves to the configured default namespace.

use crate::appliance::{ApplianceKey, KeyError};
use serde::Deserialize;


/// Single-level wildcard
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Multi-level wildcard
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Topic layout configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TopicLayout {
    /// Fixed leading segments (e.g., "home/kitchen/coffee")
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Fixed trailing attribute segment (e.g., "power")
    #[serde(default = "default_attribute")]
    pub attribute: String,

    /// Namespace used when the topic carries none
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Encode the namespace as its own topic segment
    #[serde(default)]
    pub namespaced: bool,
}

fn default_prefix() -> String {
    "home/kitchen/coffee".to_string()
}

fn default_attribute() -> String {
    "power".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            attribute: default_attribute(),
            namespace: default_namespace(),
            namespaced: false,
        }
    }
}

/// Topic parsing errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TopicError {
    #[error("topic '{0}' does not start with the configured prefix")]
    PrefixMismatch(String),
    #[error("topic '{topic}' has {found} segments after the prefix, expected {expected}")]
    SegmentCount {
        topic: String,
        found: usize,
        expected: usize,
    },
    #[error("topic '{0}' does not end with the configured attribute")]
    AttributeMismatch(String),
    #[error("topic '{topic}' addresses an invalid key: {source}")]
    InvalidKey { topic: String, source: KeyError },
    #[error("appliance {key} is outside namespace '{namespace}'; topics carry no namespace segment")]
    ForeignNamespace { key: ApplianceKey, namespace: String },
}

impl TopicLayout {
    /// Validate the layout itself (used by config validation)
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [("prefix", &self.prefix), ("attribute", &self.attribute)] {
            if value.is_empty() {
                return Err(format!("topics.{} must not be empty", field));
            }
            if value.starts_with('/') || value.ends_with('/') || value.contains("//") {
                return Err(format!("topics.{} has an empty segment: '{}'", field, value));
            }
            if value.contains(SINGLE_LEVEL_WILDCARD) || value.contains(MULTI_LEVEL_WILDCARD) {
                return Err(format!("topics.{} must not contain wildcards: '{}'", field, value));
            }
        }
        if self.attribute.contains('/') {
            return Err(format!(
                "topics.attribute must be a single segment: '{}'",
                self.attribute
            ));
        }
        crate::appliance::validate_segment("namespace", &self.namespace)
            .map_err(|e| format!("topics.namespace: {}", e))
    }

    /// Check that `key` has a topic of its own.
    ///
    /// Without a namespace segment only keys in the configured namespace are
    /// addressable; any other namespace would share its device topic.
    pub fn addresses(&self, key: &ApplianceKey) -> Result<(), TopicError> {
        if self.namespaced || key.namespace == self.namespace {
            Ok(())
        } else {
            Err(TopicError::ForeignNamespace {
                key: key.clone(),
                namespace: self.namespace.clone(),
            })
        }
    }

    /// Topic an appliance's desired state is published to
    pub fn topic_for(&self, key: &ApplianceKey) -> Result<String, TopicError> {
        self.addresses(key)?;
        let topic = if self.namespaced {
            format!(
                "{}/{}/{}/{}",
                self.prefix, key.namespace, key.name, self.attribute
            )
        } else {
            format!("{}/{}/{}", self.prefix, key.name, self.attribute)
        };
        Ok(topic)
    }

    /// Subscription filter covering every appliance
    pub fn subscription_pattern(&self) -> String {
        if self.namespaced {
            format!(
                "{}/{}/{}/{}",
                self.prefix, SINGLE_LEVEL_WILDCARD, SINGLE_LEVEL_WILDCARD, self.attribute
            )
        } else {
            format!("{}/{}/{}", self.prefix, SINGLE_LEVEL_WILDCARD, self.attribute)
        }
    }

    /// Resolve the appliance a topic addresses
    pub fn parse(&self, topic: &str) -> Result<ApplianceKey, TopicError> {
        let rest = topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| TopicError::PrefixMismatch(topic.to_string()))?;

        let parts: Vec<&str> = rest.split('/').collect();
        let expected = if self.namespaced { 3 } else { 2 };
        if parts.len() != expected {
            return Err(TopicError::SegmentCount {
                topic: topic.to_string(),
                found: parts.len(),
                expected,
            });
        }

        if parts[expected - 1] != self.attribute {
            return Err(TopicError::AttributeMismatch(topic.to_string()));
        }

        let (namespace, name) = if self.namespaced {
            (parts[0], parts[1])
        } else {
            (self.namespace.as_str(), parts[0])
        };

        ApplianceKey::parse(namespace, name).map_err(|source| TopicError::InvalidKey {
            topic: topic.to_string(),
            source,
        })
    }
}

/// Match a topic against a subscription filter using `+` / `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Convert a `/`-separated topic or filter to a NATS subject
pub fn to_nats_subject(topic: &str) -> String {
    topic
        .split('/')
        .map(|segment| match segment {
            SINGLE_LEVEL_WILDCARD => "*",
            MULTI_LEVEL_WILDCARD => ">",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Convert a NATS subject back to a `/`-separated topic
pub fn from_nats_subject(subject: &str) -> String {
    subject.replace('.', "/")
}
