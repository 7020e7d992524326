use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Controller counters
#[derive(Debug, Default)]
pub struct ControllerMetrics {
    triggers: AtomicU64,
    watch_events: AtomicU64,
    resyncs: AtomicU64,
    reconciles: AtomicU64,
    succeeded: AtomicU64,
    not_found: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    requeued: AtomicU64,
}

/// Point-in-time copy of [`ControllerMetrics`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ControllerMetricsSnapshot {
    pub triggers: u64,
    pub watch_events: u64,
    pub resyncs: u64,
    pub reconciles: u64,
    pub succeeded: u64,
    pub not_found: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub requeued: u64,
    pub queue_depth: usize,
}

impl ControllerMetrics {
    pub fn record_trigger(&self) {
        self.triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_watch_event(&self) {
        self.watch_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconcile(&self) {
        self.reconciles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeue(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, queue_depth: usize) -> ControllerMetricsSnapshot {
        ControllerMetricsSnapshot {
            triggers: self.triggers.load(Ordering::Relaxed),
            watch_events: self.watch_events.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            reconciles: self.reconciles.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            queue_depth,
        }
    }
}
