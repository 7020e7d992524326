//! NATS JetStream backend.
//!
//! Topics map onto subjects (`/` becomes `.`). Publishes go through JetStream and wait
//! for the stream's publish acknowledgement; subscriptions are durable pull consumers
//! whose messages are acknowledged by the event bridge.

use super::{
    Acknowledge, Backoff, ConnectionState, InboundMessage, InboundSender, PublishOptions, QoS,
    Transport, TransportConfig, TransportError,
};
use crate::topic::{from_nats_subject, to_nats_subject};
use anyhow::{Context, Result};
use async_nats::jetstream::{self, consumer, stream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// JetStream stream and consumer settings
#[derive(Clone, Debug, Deserialize)]
pub struct NatsStreamConfig {
    #[serde(default = "default_stream_name")]
    pub stream_name: String,

    /// Durable consumer name used by subscriptions
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,

    #[serde(default = "default_max_bytes")]
    pub max_bytes: i64,
}

fn default_stream_name() -> String {
    "APPLIANCES".to_string()
}

fn default_consumer_name() -> String {
    "appliance-operator".to_string()
}

fn default_max_age_days() -> i64 {
    1
}

fn default_max_bytes() -> i64 {
    256 * 1024 * 1024
}

impl Default for NatsStreamConfig {
    fn default() -> Self {
        Self {
            stream_name: default_stream_name(),
            consumer_name: default_consumer_name(),
            max_age_days: default_max_age_days(),
            max_bytes: default_max_bytes(),
        }
    }
}

struct NatsAcker(jetstream::Message);

#[async_trait]
impl Acknowledge for NatsAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.0
            .ack()
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }
}

/// NATS JetStream transport
pub struct NatsTransport {
    jetstream: jetstream::Context,
    stream: NatsStreamConfig,
    reconnect: super::BackoffConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown: watch::Receiver<bool>,
}

impl NatsTransport {
    /// Connect to NATS and initialize JetStream
    pub async fn connect(config: &TransportConfig, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let url = config.url();
        info!("Connecting to NATS at {}", url);

        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let state_tx = Arc::new(state_tx);

        let events = state_tx.clone();
        let mut options = async_nats::ConnectOptions::new()
            .name(config.client_id())
            .connection_timeout(config.connect_timeout())
            .event_callback(move |event| {
                let events = events.clone();
                async move {
                    match connection_state_for(&event) {
                        Some(state) => {
                            if state == ConnectionState::Connected {
                                info!("NATS connection established");
                            } else {
                                warn!("NATS connection lost");
                            }
                            events.send_replace(state);
                        }
                        None => debug!(event = ?event, "NATS client event"),
                    }
                }
            });
        if let Some(username) = &config.username {
            options = options.user_and_password(
                username.clone(),
                config.password.clone().unwrap_or_default(),
            );
        }

        let client = options
            .connect(url.as_str())
            .await
            .context("Failed to connect to NATS")?;
        state_tx.send_replace(ConnectionState::Connected);

        let jetstream = jetstream::new(client.clone());

        // Flush and report closed when the operator shuts down
        {
            let mut shutdown = shutdown.clone();
            let state_tx = state_tx.clone();
            tokio::spawn(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
                if let Err(e) = client.flush().await {
                    debug!(error = %e, "NATS flush on shutdown failed");
                }
                state_tx.send_replace(ConnectionState::Closed);
            });
        }

        Ok(Self {
            jetstream,
            stream: config.nats.clone(),
            reconnect: config.reconnect.clone(),
            state_tx,
            shutdown,
        })
    }

    /// Ensure the JetStream stream exists and covers `subject`
    async fn ensure_stream(&self, subject: &str) -> Result<stream::Stream> {
        info!("Ensuring JetStream stream '{}' exists", self.stream.stream_name);

        if let Ok(existing) = self.jetstream.get_stream(&self.stream.stream_name).await {
            info!("Stream '{}' already exists", self.stream.stream_name);
            return Ok(existing);
        }

        let stream_config = stream::Config {
            name: self.stream.stream_name.clone(),
            subjects: vec![subject.to_string()],
            max_age: std::time::Duration::from_secs((self.stream.max_age_days.max(0) * 86400) as u64),
            max_bytes: self.stream.max_bytes,
            storage: stream::StorageType::File,
            retention: stream::RetentionPolicy::Limits,
            ..Default::default()
        };

        let stream = self
            .jetstream
            .create_stream(stream_config)
            .await
            .context("Failed to create JetStream stream")?;

        info!("Created JetStream stream '{}'", self.stream.stream_name);
        Ok(stream)
    }
}

#[async_trait]
impl Transport for NatsTransport {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        if !self.connection_state().is_connected() {
            return Err(TransportError::NotConnected);
        }

        let subject = to_nats_subject(topic);
        let ack = self
            .jetstream
            .publish(subject, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        // Fire-and-forget when the caller does not ask for delivery guarantees
        if options.qos == QoS::AtMostOnce {
            return Ok(());
        }

        match tokio::time::timeout(options.ack_timeout, ack).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Publish(e.to_string())),
            Err(_) => Err(TransportError::AckTimeout(options.ack_timeout)),
        }
    }

    async fn subscribe(
        &self,
        filter: &str,
        _qos: QoS,
        sink: InboundSender,
    ) -> Result<(), TransportError> {
        let subject = to_nats_subject(filter);
        let stream = self
            .ensure_stream(&subject)
            .await
            .map_err(|e| TransportError::Subscribe(format!("{:#}", e)))?;

        let consumer = stream
            .get_or_create_consumer(
                &self.stream.consumer_name,
                consumer::pull::Config {
                    durable_name: Some(self.stream.consumer_name.clone()),
                    filter_subject: subject.clone(),
                    deliver_policy: consumer::DeliverPolicy::New,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        info!(subject = %subject, consumer = %self.stream.consumer_name, "Subscribed");

        tokio::spawn(consume(
            consumer,
            sink,
            Backoff::new(self.reconnect.clone()),
            self.shutdown.clone(),
        ));
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

/// Pull messages into the sink until shutdown, re-opening the message stream on failure
async fn consume(
    consumer: consumer::Consumer<consumer::pull::Config>,
    sink: InboundSender,
    mut backoff: Backoff,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut messages = match consumer.messages().await {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "Failed to open JetStream message stream");
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };
        backoff.reset();

        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => return,
                next = messages.next() => next,
            };

            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    error!(error = %e, "Error receiving message");
                    continue;
                }
                None => break,
            };

            let sequence = msg.info().map(|info| info.stream_sequence).ok();
            let topic = from_nats_subject(&msg.subject);
            let payload = msg.payload.clone();

            let mut message = InboundMessage::new(topic.clone(), payload).with_acker(NatsAcker(msg));
            if let Some(sequence) = sequence {
                message = message.with_message_id(sequence);
            }

            if let Err(e) = sink.deliver(message).await {
                warn!(topic = %topic, error = %e, "Inbound message dropped");
                if sink.is_closed() {
                    return;
                }
            }
        }

        warn!("JetStream message stream ended, re-opening");
    }
}

/// Connection state implied by a client event, if any.
///
/// The client reports no terminal event; `Closed` is published by the shutdown task.
fn connection_state_for(event: &async_nats::Event) -> Option<ConnectionState> {
    match event {
        async_nats::Event::Connected => Some(ConnectionState::Connected),
        async_nats::Event::Disconnected => Some(ConnectionState::Disconnected {
            reason: "disconnected from server".to_string(),
        }),
        _ => None,
    }
}
