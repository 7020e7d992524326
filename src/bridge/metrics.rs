use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for every way an inbound message can end
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    received: AtomicU64,
    triggered: AtomicU64,
    suppressed: AtomicU64,
    unknown_topic: AtomicU64,
    invalid_payload: AtomicU64,
    not_found: AtomicU64,
    store_errors: AtomicU64,
    triggers_dropped: AtomicU64,
    ack_failures: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BridgeMetricsSnapshot {
    pub received: u64,
    pub triggered: u64,
    pub suppressed: u64,
    pub unknown_topic: u64,
    pub invalid_payload: u64,
    pub not_found: u64,
    pub store_errors: u64,
    pub triggers_dropped: u64,
    pub ack_failures: u64,
    /// Messages the transport could not hand to the bridge
    pub dropped: u64,
}

impl BridgeMetrics {
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: super::BridgeOutcome) {
        use super::BridgeOutcome::*;
        let counter = match outcome {
            Triggered => &self.triggered,
            Suppressed => &self.suppressed,
            UnknownTopic => &self.unknown_topic,
            InvalidPayload => &self.invalid_payload,
            NotFound => &self.not_found,
            StoreUnavailable => &self.store_errors,
            ControllerGone => &self.triggers_dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack_failure(&self) {
        self.ack_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, dropped: u64) -> BridgeMetricsSnapshot {
        BridgeMetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            triggered: self.triggered.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            unknown_topic: self.unknown_topic.load(Ordering::Relaxed),
            invalid_payload: self.invalid_payload.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            triggers_dropped: self.triggers_dropped.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            dropped,
        }
    }
}
