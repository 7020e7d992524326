//! MQTT backend on top of `rumqttc`.
//!
//! A driver task owns the event loop: it publishes connection health, reconnects with
//! exponential backoff, re-issues subscriptions when the broker lost the session,
//! routes inbound publishes into the subscription queues and resolves publish waiters
//! from PUBACK/PUBCOMP. Publishes are serialised behind a gate so the one pending
//! waiter is paired with the next newly issued packet id, never a retransmission.

use super::{
    lock, Acknowledge, Backoff, ConnectionState, InboundMessage, InboundSender, PublishOptions,
    QoS, Transport, TransportConfig, TransportError,
};
use crate::topic::topic_matches;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

const DEFAULT_PORT: u16 = 1883;

/// Split `mqtt://host:port` (or `tcp://`, or bare `host[:port]`) into host and port
pub fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    if url.starts_with("mqtts://") || url.starts_with("ssl://") {
        bail!("TLS broker URLs are not supported: {}", url);
    }

    let authority = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url)
        .trim_end_matches('/');

    if authority.is_empty() {
        bail!("Broker URL has no host: '{}'", url);
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid broker port in '{}'", url))?;
            if host.is_empty() {
                bail!("Broker URL has no host: '{}'", url);
            }
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), DEFAULT_PORT)),
    }
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

struct Subscription {
    filter: String,
    qos: QoS,
    sink: InboundSender,
}

struct PendingPublish {
    qos: QoS,
    pkid: Option<u16>,
    done: oneshot::Sender<Result<(), TransportError>>,
}

/// State shared between the client handle and the driver task
struct Shared {
    subscriptions: Mutex<Vec<Subscription>>,
    pending: Mutex<Option<PendingPublish>>,
    /// Packet ids sent at QoS 1/2 and not yet acknowledged; the event loop re-emits
    /// them after a reconnect. Locked after `pending`.
    inflight: Mutex<HashSet<u16>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Pair the pending waiter with the packet id the event loop just sent.
    ///
    /// A retransmitted packet id belongs to an earlier publish and is never paired.
    fn assign(&self, pkid: u16) {
        let mut pending = lock(&self.pending);
        let mut inflight = lock(&self.inflight);
        if inflight.contains(&pkid) {
            return;
        }
        let Some(waiter) = pending.as_mut() else {
            return;
        };
        if waiter.pkid.is_some() {
            return;
        }
        if waiter.qos == QoS::AtMostOnce {
            if let Some(waiter) = pending.take() {
                let _ = waiter.done.send(Ok(()));
            }
            return;
        }
        inflight.insert(pkid);
        waiter.pkid = Some(pkid);
    }

    fn complete(&self, pkid: u16) {
        let mut pending = lock(&self.pending);
        lock(&self.inflight).remove(&pkid);
        if pending.as_ref().and_then(|w| w.pkid) == Some(pkid) {
            if let Some(waiter) = pending.take() {
                let _ = waiter.done.send(Ok(()));
            }
        }
    }

    fn fail_pending(&self, error: TransportError) {
        if let Some(waiter) = lock(&self.pending).take() {
            let _ = waiter.done.send(Err(error));
        }
    }

    fn sink_for(&self, topic: &str) -> Option<InboundSender> {
        lock(&self.subscriptions)
            .iter()
            .find(|s| topic_matches(&s.filter, topic))
            .map(|s| s.sink.clone())
    }
}

struct MqttAcker {
    client: AsyncClient,
    publish: Publish,
}

#[async_trait]
impl Acknowledge for MqttAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.client
            .ack(&self.publish)
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }
}

/// MQTT transport
pub struct MqttTransport {
    client: AsyncClient,
    shared: Arc<Shared>,
    publish_gate: tokio::sync::Mutex<()>,
}

impl MqttTransport {
    /// Create the client, start the driver and wait (bounded) for the first CONNACK
    pub async fn connect(config: &TransportConfig, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let url = config.url();
        let (host, port) = parse_broker_url(&url)?;
        let client_id = config.client_id();

        let mut options = MqttOptions::new(client_id.clone(), host.clone(), port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(config.clean_session);
        // Inbound messages are acknowledged by the event bridge, not on receipt
        options.set_manual_acks(true);
        if let Some(username) = &config.username {
            options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, config.request_capacity.max(1));
        let (state_tx, mut state_rx) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            subscriptions: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
            inflight: Mutex::new(HashSet::new()),
            state_tx,
        });

        info!(host = %host, port = port, client_id = %client_id, "Starting MQTT connection driver");
        tokio::spawn(drive(
            eventloop,
            client.clone(),
            shared.clone(),
            Backoff::new(config.reconnect.clone()),
            shutdown,
        ));

        match tokio::time::timeout(config.connect_timeout(), state_rx.wait_for(|s| s.is_connected())).await {
            Ok(Ok(_)) => info!(host = %host, port = port, "Connected to MQTT broker"),
            Ok(Err(_)) => bail!("MQTT driver stopped before connecting"),
            Err(_) => warn!(
                host = %host,
                port = port,
                timeout_ms = config.connect_timeout_ms,
                "MQTT broker not reachable yet, continuing; reconciles retry until connected"
            ),
        }

        Ok(Self {
            client,
            shared,
            publish_gate: tokio::sync::Mutex::new(()),
        })
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn name(&self) -> &'static str {
        "mqtt"
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

        let _gate = self.publish_gate.lock().await;
        let (done, waiter) = oneshot::channel();
        *lock(&self.shared.pending) = Some(PendingPublish {
            qos: options.qos,
            pkid: None,
            done,
        });

        if let Err(e) = self
            .client
            .publish_bytes(topic, to_mqtt_qos(options.qos), options.retain, payload)
            .await
        {
            lock(&self.shared.pending).take();
            return Err(TransportError::Publish(e.to_string()));
        }

        match tokio::time::timeout(options.ack_timeout, waiter).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                lock(&self.shared.pending).take();
                Err(TransportError::AckTimeout(options.ack_timeout))
            }
        }
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        sink: InboundSender,
    ) -> Result<(), TransportError> {
        lock(&self.shared.subscriptions).push(Subscription {
            filter: filter.to_string(),
            qos,
            sink,
        });

        self.client
            .subscribe(filter, to_mqtt_qos(qos))
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        info!(filter = %filter, qos = ?qos, "Subscribed");
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }
}

/// Event loop driver: runs until shutdown
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    mut backoff: Backoff,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(session_present = ack.session_present, "MQTT connection established");
                backoff.reset();
                shared.set_state(ConnectionState::Connected);
                if !ack.session_present {
                    resubscribe(&client, &shared);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                route(&client, &shared, publish).await;
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => shared.complete(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => shared.complete(comp.pkid),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => shared.assign(pkid),
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT connection error");
                shared.fail_pending(TransportError::NotConnected);
                shared.set_state(ConnectionState::Disconnected {
                    reason: e.to_string(),
                });

                let delay = backoff.next_delay();
                shared.set_state(ConnectionState::Reconnecting {
                    attempt: backoff.attempt(),
                    delay_ms: delay.as_millis() as u64,
                });
                debug!(delay_ms = delay.as_millis() as u64, attempt = backoff.attempt(), "Reconnecting to MQTT broker");

                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    info!("MQTT connection driver stopping");
    shared.fail_pending(TransportError::Closed);
    shared.set_state(ConnectionState::Closed);
    if let Err(e) = client.try_disconnect() {
        debug!(error = %e, "MQTT disconnect request not sent");
    }
}

fn resubscribe(client: &AsyncClient, shared: &Shared) {
    for subscription in lock(&shared.subscriptions).iter() {
        if let Err(e) = client.try_subscribe(subscription.filter.clone(), to_mqtt_qos(subscription.qos)) {
            error!(filter = %subscription.filter, error = %e, "Failed to re-subscribe");
        } else {
            info!(filter = %subscription.filter, "Re-subscribed after session loss");
        }
    }
}

async fn route(client: &AsyncClient, shared: &Shared, publish: Publish) {
    let topic = publish.topic.clone();
    let Some(sink) = shared.sink_for(&topic) else {
        debug!(topic = %topic, "No subscription for inbound message");
        return;
    };

    let message = InboundMessage::new(topic.clone(), publish.payload.clone())
        .with_message_id(u64::from(publish.pkid))
        .with_acker(MqttAcker {
            client: client.clone(),
            publish,
        });

    if let Err(e) = sink.deliver(message).await {
        warn!(topic = %topic, error = %e, "Inbound message dropped");
    }
}
