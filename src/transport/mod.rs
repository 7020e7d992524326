//! Publish/subscribe transport to the appliances.
//!
//! Every backend implements [`Transport`]: publish with a bounded wait for the broker
//! acknowledgement, subscribe a topic filter into an [`InboundSender`], and expose a
//! [`ConnectionState`] health signal. Reconnection is the backend's job; callers only
//! check the signal and treat "not connected" as retryable.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

pub mod backoff;
pub mod loopback;
pub mod mqtt;
pub mod nats;
pub mod queue;

pub use backoff::{Backoff, BackoffConfig};
pub use loopback::LoopbackTransport;
pub use mqtt::MqttTransport;
pub use nats::{NatsStreamConfig, NatsTransport};
pub use queue::{
    inbound_queue, DeliveryError, DropCounter, InboundQueueConfig, InboundReceiver, InboundSender,
    OverflowPolicy,
};

/// Delivery guarantee requested from the broker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid QoS level {} (expected 0, 1 or 2)", other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// Connection health as reported by a backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay_ms: u64 },
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("no publish acknowledgement within {0:?}")]
    AckTimeout(Duration),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("acknowledge failed: {0}")]
    Ack(String),
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// True when the failure means the connection itself is down
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::NotConnected | TransportError::Closed)
    }
}

/// Publish parameters
#[derive(Clone, Copy, Debug)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
    /// Upper bound on the wait for the broker acknowledgement
    pub ack_timeout: Duration,
}

/// Acknowledges one inbound message back to the broker
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;
}

/// A message received on a subscription
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    /// Broker-assigned id (packet id or stream sequence), for logging
    pub message_id: Option<u64>,
    acker: Option<Box<dyn Acknowledge>>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            message_id: None,
            acker: None,
        }
    }

    pub fn with_message_id(mut self, message_id: u64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_acker(mut self, acker: impl Acknowledge + 'static) -> Self {
        self.acker = Some(Box::new(acker));
        self
    }

    /// Acknowledge the message. Messages without an acker (QoS 0) succeed trivially.
    pub async fn ack(self) -> Result<(), TransportError> {
        match self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("topic", &self.topic)
            .field("payload", &self.payload)
            .field("message_id", &self.message_id)
            .field("ackable", &self.acker.is_some())
            .finish()
    }
}

/// Publish/subscribe client used by the reconciler and the event bridge
#[async_trait]
pub trait Transport: Send + Sync {
    /// Backend name for logs and health output
    fn name(&self) -> &'static str;

    /// Publish and wait (bounded by `options.ack_timeout`) for broker confirmation
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), TransportError>;

    /// Subscribe a topic filter; matching messages are delivered into `sink`
    async fn subscribe(&self, filter: &str, qos: QoS, sink: InboundSender)
        -> Result<(), TransportError>;

    /// Current connection health
    fn connection_state(&self) -> ConnectionState;

    /// Stream of connection health changes
    fn watch_connection(&self) -> watch::Receiver<ConnectionState>;
}

/// Transport backend selector
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Mqtt,
    Nats,
    Loopback,
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mqtt" => Ok(TransportKind::Mqtt),
            "nats" => Ok(TransportKind::Nats),
            "loopback" => Ok(TransportKind::Loopback),
            other => Err(format!("unknown transport kind '{}'", other)),
        }
    }
}

/// Transport configuration
#[derive(Clone, Debug, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_kind")]
    pub kind: TransportKind,

    /// Broker URL; defaults depend on `kind`
    #[serde(default)]
    pub url: Option<String>,

    /// Client identifier; generated when absent
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// QoS used for both publish and subscribe
    #[serde(default = "default_qos")]
    pub qos: QoS,

    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// How long startup waits for the first connection before carrying on
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default)]
    pub clean_session: bool,

    /// Capacity of the client's outgoing request channel
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,

    #[serde(default)]
    pub reconnect: BackoffConfig,

    #[serde(default)]
    pub nats: NatsStreamConfig,

    /// Loopback only: deliver published messages back to subscribers
    #[serde(default = "default_loopback_echo")]
    pub loopback_echo: bool,
}

fn default_kind() -> TransportKind {
    TransportKind::Mqtt
}

fn default_qos() -> QoS {
    QoS::AtLeastOnce
}

fn default_ack_timeout_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_request_capacity() -> usize {
    64
}

fn default_loopback_echo() -> bool {
    true
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            url: None,
            client_id: None,
            username: None,
            password: None,
            qos: default_qos(),
            ack_timeout_ms: default_ack_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            keep_alive_secs: default_keep_alive_secs(),
            clean_session: false,
            request_capacity: default_request_capacity(),
            reconnect: BackoffConfig::default(),
            nats: NatsStreamConfig::default(),
            loopback_echo: default_loopback_echo(),
        }
    }
}

impl TransportConfig {
    /// Configured URL, or the conventional local broker for the backend
    pub fn url(&self) -> String {
        match (&self.url, self.kind) {
            (Some(url), _) => url.clone(),
            (None, TransportKind::Mqtt) => "mqtt://localhost:1883".to_string(),
            (None, TransportKind::Nats) => "nats://localhost:4222".to_string(),
            (None, TransportKind::Loopback) => "loopback://".to_string(),
        }
    }

    pub fn client_id(&self) -> String {
        self.client_id.clone().unwrap_or_else(|| {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("appliance-operator-{}", &suffix[..8])
        })
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn publish_options(&self) -> PublishOptions {
        PublishOptions {
            qos: self.qos,
            retain: false,
            ack_timeout: self.ack_timeout(),
        }
    }
}

/// Connect the configured backend
pub async fn connect(
    config: &TransportConfig,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Arc<dyn Transport>> {
    info!(kind = ?config.kind, url = %config.url(), "Connecting transport");

    let transport: Arc<dyn Transport> = match config.kind {
        TransportKind::Mqtt => Arc::new(MqttTransport::connect(config, shutdown).await?),
        TransportKind::Nats => Arc::new(NatsTransport::connect(config, shutdown).await?),
        TransportKind::Loopback => Arc::new(LoopbackTransport::new(config.loopback_echo)),
    };

    Ok(transport)
}

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
