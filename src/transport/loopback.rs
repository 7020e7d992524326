//! In-process broker.
//!
//! Routes published messages to matching subscriptions inside the process. With echo
//! enabled every publish comes straight back, which stands in for devices that
//! confirm commands immediately. Tests drive it through `inject`, failure injection
//! and the recorded publishes.

use super::{
    lock, Acknowledge, ConnectionState, InboundMessage, InboundSender, PublishOptions, QoS,
    Transport, TransportError,
};
use crate::topic::topic_matches;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// A message the loopback broker accepted
#[derive(Clone, Debug, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Observes whether an injected message was acknowledged
#[derive(Clone, Debug)]
pub struct AckHandle(Arc<AtomicBool>);

impl AckHandle {
    pub fn is_acked(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct LoopbackAcker {
    flag: Arc<AtomicBool>,
    acked: Arc<AtomicU64>,
}

#[async_trait]
impl Acknowledge for LoopbackAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        if !self.flag.swap(true, Ordering::SeqCst) {
            self.acked.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// In-process publish/subscribe broker
pub struct LoopbackTransport {
    echo: bool,
    subscriptions: Mutex<Vec<(String, InboundSender)>>,
    published: Mutex<Vec<PublishedMessage>>,
    failures: Mutex<VecDeque<TransportError>>,
    ack_delay: Mutex<Option<Duration>>,
    acked: Arc<AtomicU64>,
    next_message_id: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
}

impl LoopbackTransport {
    pub fn new(echo: bool) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        Self {
            echo,
            subscriptions: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            ack_delay: Mutex::new(None),
            acked: Arc::new(AtomicU64::new(0)),
            next_message_id: AtomicU64::new(1),
            state_tx,
        }
    }

    /// Every message accepted so far, in publish order
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    /// Flip the connection health signal
    pub fn set_connected(&self, connected: bool) {
        let state = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected {
                reason: "loopback disconnected".to_string(),
            }
        };
        self.state_tx.send_replace(state);
    }

    /// Make the next publish fail with `error`
    pub fn fail_next_publish(&self, error: TransportError) {
        lock(&self.failures).push_back(error);
    }

    /// Delay broker acknowledgements; delays beyond the ack timeout time out
    pub fn set_ack_delay(&self, delay: Option<Duration>) {
        *lock(&self.ack_delay) = delay;
    }

    /// Inbound messages acknowledged so far
    pub fn acked_count(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }

    /// Deliver a message as if a device had published it
    pub async fn inject(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> Result<AckHandle, TransportError> {
        let handle = AckHandle(Arc::new(AtomicBool::new(false)));
        let payload = payload.into();

        for sink in self.matching_sinks(topic) {
            let message = InboundMessage::new(topic, payload.clone())
                .with_message_id(self.next_message_id.fetch_add(1, Ordering::SeqCst))
                .with_acker(LoopbackAcker {
                    flag: handle.0.clone(),
                    acked: self.acked.clone(),
                });
            sink.deliver(message)
                .await
                .map_err(|e| TransportError::Publish(e.to_string()))?;
        }

        Ok(handle)
    }

    fn matching_sinks(&self, topic: &str) -> Vec<InboundSender> {
        lock(&self.subscriptions)
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, sink)| sink.clone())
            .collect()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
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

        let failure = lock(&self.failures).pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        let delay = *lock(&self.ack_delay);
        if let Some(delay) = delay {
            if delay > options.ack_timeout {
                tokio::time::sleep(options.ack_timeout).await;
                return Err(TransportError::AckTimeout(options.ack_timeout));
            }
            tokio::time::sleep(delay).await;
        }

        lock(&self.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
            qos: options.qos,
            retain: options.retain,
        });
        debug!(topic = %topic, "Loopback accepted publish");

        if self.echo {
            for sink in self.matching_sinks(topic) {
                let message = InboundMessage::new(topic, payload.clone())
                    .with_message_id(self.next_message_id.fetch_add(1, Ordering::SeqCst))
                    .with_acker(LoopbackAcker {
                        flag: Arc::new(AtomicBool::new(false)),
                        acked: self.acked.clone(),
                    });
                // Off the publisher's path, like a real broker round trip
                let topic = topic.to_string();
                tokio::spawn(async move {
                    if let Err(e) = sink.deliver(message).await {
                        warn!(topic = %topic, error = %e, "Loopback echo dropped");
                    }
                });
            }
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        _qos: QoS,
        sink: InboundSender,
    ) -> Result<(), TransportError> {
        lock(&self.subscriptions).push((filter.to_string(), sink));
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}
