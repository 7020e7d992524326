use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

pub use crate::controller::ControllerConfig;
pub use crate::snapshot::config::SnapshotConfig;
pub use crate::topic::TopicLayout;
pub use crate::transport::{InboundQueueConfig, TransportConfig};

/// Environment variable naming the TOML config file
pub const CONFIG_PATH_ENV: &str = "APPLIANCE_OPERATOR_CONFIG";

/// Complete operator configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub topics: TopicLayout,
    /// Inbound queue between the transport subscription and the event bridge
    #[serde(default)]
    pub bridge: InboundQueueConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl OperatorConfig {
    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(kind) = lookup("APPLIANCE_TRANSPORT_KIND") {
            self.transport.kind = kind
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Invalid APPLIANCE_TRANSPORT_KIND")?;
        }
        if let Some(url) = lookup("APPLIANCE_TRANSPORT_URL") {
            self.transport.url = Some(url);
        }
        if let Some(bind) = lookup("APPLIANCE_API_BIND") {
            self.api.bind = bind;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            self.transport.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.transport.password = Some(password);
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Reject configurations the operator cannot run with
    pub fn validate(&self) -> Result<()> {
        if let Err(e) = self.topics.validate() {
            bail!("Invalid topic layout: {}", e);
        }
        if self.controller.workers == 0 {
            bail!("controller.workers must be at least 1");
        }
        if self.controller.retry_base_delay_ms == 0 {
            bail!("controller.retry_base_delay_ms must be greater than 0");
        }
        if self.controller.retry_max_delay_ms < self.controller.retry_base_delay_ms {
            bail!("controller.retry_max_delay_ms must not be smaller than retry_base_delay_ms");
        }
        if self.transport.ack_timeout_ms == 0 {
            bail!("transport.ack_timeout_ms must be greater than 0");
        }
        if self.bridge.capacity == 0 {
            bail!("bridge.capacity must be at least 1");
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<OperatorConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: OperatorConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Load from `APPLIANCE_OPERATOR_CONFIG` (or built-in defaults), apply environment
/// overrides and validate
pub fn load_from_env() -> Result<OperatorConfig> {
    let mut config = match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) => {
            info!(path = %path, "Loading configuration");
            load_config(Path::new(&path))?
        }
        Err(_) => {
            info!("{} not set, using default configuration", CONFIG_PATH_ENV);
            OperatorConfig::default()
        }
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{OverflowPolicy, QoS, TransportKind};
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = OperatorConfig::default();
        assert_eq!(config.transport.kind, TransportKind::Mqtt);
        assert_eq!(config.transport.url(), "mqtt://localhost:1883");
        assert_eq!(config.transport.qos, QoS::AtLeastOnce);
        assert_eq!(config.transport.ack_timeout_ms, 1000);
        assert_eq!(config.topics.prefix, "home/kitchen/coffee");
        assert_eq!(config.topics.attribute, "power");
        assert_eq!(config.topics.namespace, "default");
        assert_eq!(config.bridge.capacity, 1);
        assert_eq!(config.bridge.overflow, OverflowPolicy::Block);
        assert_eq!(config.controller.workers, 2);
        assert_eq!(config.api.bind, "0.0.0.0:3000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [transport]
            kind = "nats"
            url = "nats://broker:4222"
            qos = 2
            ack_timeout_ms = 2500

            [transport.nats]
            stream_name = "KITCHEN"

            [transport.reconnect]
            initial_delay_ms = 100

            [topics]
            prefix = "home/lab/espresso"
            namespace = "lab"
            namespaced = true

            [bridge]
            capacity = 16
            overflow = "reject"

            [controller]
            workers = 4

            [snapshot]
            enabled = false
            directory = "/tmp/snapshots"

            [api]
            bind = "127.0.0.1:8080"
        "#;

        let config: OperatorConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.transport.kind, TransportKind::Nats);
        assert_eq!(config.transport.url(), "nats://broker:4222");
        assert_eq!(config.transport.qos, QoS::ExactlyOnce);
        assert_eq!(config.transport.nats.stream_name, "KITCHEN");
        assert_eq!(config.transport.reconnect.initial_delay_ms, 100);
        assert_eq!(config.transport.reconnect.max_delay_ms, 30_000);
        assert_eq!(config.topics.prefix, "home/lab/espresso");
        assert_eq!(config.topics.attribute, "power");
        assert!(config.topics.namespaced);
        assert_eq!(config.bridge.capacity, 16);
        assert_eq!(config.bridge.overflow, OverflowPolicy::Reject);
        assert_eq!(config.controller.workers, 4);
        assert!(!config.snapshot.enabled);
        assert_eq!(config.api.bind, "127.0.0.1:8080");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_qos_is_rejected() {
        let result: Result<OperatorConfig, _> = toml::from_str("[transport]\nqos = 3\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("APPLIANCE_TRANSPORT_KIND", "loopback"),
            ("APPLIANCE_TRANSPORT_URL", "mqtt://other:1883"),
            ("APPLIANCE_API_BIND", "127.0.0.1:9999"),
            ("MQTT_USERNAME", "operator"),
            ("MQTT_PASSWORD", "secret"),
        ]
        .into_iter()
        .collect();

        let mut config = OperatorConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.transport.kind, TransportKind::Loopback);
        assert_eq!(config.transport.url.as_deref(), Some("mqtt://other:1883"));
        assert_eq!(config.api.bind, "127.0.0.1:9999");
        assert_eq!(config.transport.username.as_deref(), Some("operator"));
        assert_eq!(config.transport.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_unknown_transport_kind_override_fails() {
        let mut config = OperatorConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "APPLIANCE_TRANSPORT_KIND").then(|| "carrier-pigeon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = OperatorConfig::default();
        config.topics.prefix = "home/+/coffee".to_string();
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.topics.attribute = String::new();
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.topics.namespace = "Not Valid".to_string();
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.controller.workers = 0;
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.controller.retry_max_delay_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("operator.toml");
        std::fs::write(&path, "[topics]\nprefix = \"home/office/kettle\"\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.topics.prefix, "home/office/kettle");

        assert!(load_config(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_sample_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("operator.toml");
        let sample = load_config(&path).unwrap();
        let defaults = OperatorConfig::default();

        assert_eq!(sample.transport.url(), defaults.transport.url());
        assert_eq!(sample.transport.qos, defaults.transport.qos);
        assert_eq!(sample.topics, defaults.topics);
        assert_eq!(sample.bridge.capacity, defaults.bridge.capacity);
        assert_eq!(sample.controller.workers, defaults.controller.workers);
        assert_eq!(sample.snapshot.keep_count, defaults.snapshot.keep_count);
        assert_eq!(sample.api.bind, defaults.api.bind);
        assert!(sample.validate().is_ok());
    }
}
