//! Hand-off queue between a transport subscription and its single consumer.
//!
//! The queue is created by the owner (the operator) and injected into both sides:
//! the sender goes to [`Transport::subscribe`](super::Transport::subscribe), the
//! receiver to the event bridge. Overflow is an explicit policy so a slow consumer
//! can never stall the transport's network loop indefinitely.

use super::InboundMessage;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};

/// What the producer does when the queue is full
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for room, at most `enqueue_timeout_ms`, then drop
    Block,
    /// Drop immediately
    Reject,
}

/// Inbound queue configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct InboundQueueConfig {
    /// Number of messages buffered between transport and bridge (minimum 1)
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_overflow")]
    pub overflow: OverflowPolicy,

    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
}

fn default_capacity() -> usize {
    1
}

fn default_overflow() -> OverflowPolicy {
    OverflowPolicy::Block
}

fn default_enqueue_timeout_ms() -> u64 {
    5000
}

impl Default for InboundQueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            overflow: default_overflow(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
        }
    }
}

/// Why a message could not be handed to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("inbound queue is full")]
    Full,
    #[error("timed out waiting for room in the inbound queue")]
    TimedOut,
    #[error("inbound queue consumer has gone away")]
    Closed,
}

/// Create a connected sender/receiver pair
pub fn inbound_queue(config: &InboundQueueConfig) -> (InboundSender, InboundReceiver) {
    let (tx, rx) = mpsc::channel(config.capacity.max(1));
    let sender = InboundSender {
        tx,
        overflow: config.overflow,
        enqueue_timeout: Duration::from_millis(config.enqueue_timeout_ms),
        dropped: DropCounter::default(),
    };
    (sender, InboundReceiver { rx })
}

/// Count of messages the queue refused, readable without holding a sender
#[derive(Clone, Debug, Default)]
pub struct DropCounter(Arc<AtomicU64>);

impl DropCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// Producer side, held by the transport
#[derive(Clone, Debug)]
pub struct InboundSender {
    tx: mpsc::Sender<InboundMessage>,
    overflow: OverflowPolicy,
    enqueue_timeout: Duration,
    dropped: DropCounter,
}

impl InboundSender {
    /// Hand a message to the consumer according to the overflow policy.
    ///
    /// Dropped messages are not acknowledged, so at-least-once brokers redeliver them.
    pub async fn deliver(&self, message: InboundMessage) -> Result<(), DeliveryError> {
        let result = match self.overflow {
            OverflowPolicy::Block => self
                .tx
                .send_timeout(message, self.enqueue_timeout)
                .await
                .map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => DeliveryError::TimedOut,
                    SendTimeoutError::Closed(_) => DeliveryError::Closed,
                }),
            OverflowPolicy::Reject => self.tx.try_send(message).map_err(|e| match e {
                TrySendError::Full(_) => DeliveryError::Full,
                TrySendError::Closed(_) => DeliveryError::Closed,
            }),
        };

        if result.is_err() {
            self.dropped.increment();
        }
        result
    }

    /// Messages dropped since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }

    /// Shared handle on the drop count; it does not keep the queue open
    pub fn drop_counter(&self) -> DropCounter {
        self.dropped.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, held by the event bridge
#[derive(Debug)]
pub struct InboundReceiver {
    rx: mpsc::Receiver<InboundMessage>,
}

impl InboundReceiver {
    /// Next message, or None once every sender is gone
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(overflow: OverflowPolicy, timeout_ms: u64) -> InboundQueueConfig {
        InboundQueueConfig {
            capacity: 1,
            overflow,
            enqueue_timeout_ms: timeout_ms,
        }
    }

    #[tokio::test]
    async fn test_deliver_and_receive_in_order() {
        let (tx, mut rx) = inbound_queue(&InboundQueueConfig {
            capacity: 4,
            ..InboundQueueConfig::default()
        });

        tx.deliver(InboundMessage::new("a/1", "true")).await.unwrap();
        tx.deliver(InboundMessage::new("a/2", "false")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().topic, "a/1");
        assert_eq!(rx.recv().await.unwrap().topic, "a/2");
        assert_eq!(tx.dropped(), 0);
    }

    #[tokio::test]
    async fn test_reject_policy_drops_when_full() {
        let (tx, mut rx) = inbound_queue(&config(OverflowPolicy::Reject, 0));

        tx.deliver(InboundMessage::new("a/1", "true")).await.unwrap();
        let second = tx.deliver(InboundMessage::new("a/2", "true")).await;

        assert_eq!(second, Err(DeliveryError::Full));
        assert_eq!(tx.dropped(), 1);
        assert_eq!(rx.recv().await.unwrap().topic, "a/1");
    }

    #[tokio::test]
    async fn test_block_policy_times_out() {
        let (tx, _rx) = inbound_queue(&config(OverflowPolicy::Block, 20));

        tx.deliver(InboundMessage::new("a/1", "true")).await.unwrap();
        let second = tx.deliver(InboundMessage::new("a/2", "true")).await;

        assert_eq!(second, Err(DeliveryError::TimedOut));
        assert_eq!(tx.dropped(), 1);
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_consumer() {
        let (tx, mut rx) = inbound_queue(&config(OverflowPolicy::Block, 2000));
        tx.deliver(InboundMessage::new("a/1", "true")).await.unwrap();

        let producer = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.deliver(InboundMessage::new("a/2", "false")).await })
        };

        assert_eq!(rx.recv().await.unwrap().topic, "a/1");
        assert_eq!(producer.await.unwrap(), Ok(()));
        assert_eq!(rx.recv().await.unwrap().topic, "a/2");
    }

    #[tokio::test]
    async fn test_drop_counter_outlives_sender() {
        let (tx, mut rx) = inbound_queue(&config(OverflowPolicy::Reject, 0));
        let counter = tx.drop_counter();

        tx.deliver(InboundMessage::new("a/1", "true")).await.unwrap();
        let _ = tx.deliver(InboundMessage::new("a/2", "true")).await;
        drop(tx);

        assert_eq!(rx.recv().await.unwrap().topic, "a/1");
        assert!(rx.recv().await.is_none());
        assert_eq!(counter.get(), 1);
    }

    #[tokio::test]
    async fn test_closed_consumer() {
        let (tx, rx) = inbound_queue(&config(OverflowPolicy::Block, 100));
        drop(rx);

        assert!(tx.is_closed());
        let result = tx.deliver(InboundMessage::new("a/1", "true")).await;
        assert_eq!(result, Err(DeliveryError::Closed));
    }
}
