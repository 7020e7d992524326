//! De-duplicating work queue with per-key serialization.
//!
//! A key is held in at most one of three places: queued, processing, or processing
//! and dirty (re-added while a worker holds it). `done` moves a dirty key back onto
//! the queue, so the same key is never handed to two workers at once.

use crate::appliance::ApplianceKey;
use crate::transport::backoff::exponential_delay;
use crate::transport::lock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    queue: VecDeque<ApplianceKey>,
    dirty: HashSet<ApplianceKey>,
    processing: HashSet<ApplianceKey>,
    failures: HashMap<ApplianceKey, u32>,
    shutting_down: bool,
}

pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl WorkQueue {
    pub fn new(retry_base_delay: Duration, retry_max_delay: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            retry_base_delay,
            retry_max_delay,
        }
    }

    /// Queue a key. Returns false if it was already pending or the queue is shut down.
    pub fn add(&self, key: ApplianceKey) -> bool {
        let mut inner = lock(&self.inner);
        if inner.shutting_down || inner.dirty.contains(&key) {
            return false;
        }
        inner.dirty.insert(key.clone());
        if !inner.processing.contains(&key) {
            inner.queue.push_back(key);
            drop(inner);
            self.notify.notify_one();
        }
        true
    }

    /// Queue a key once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: ApplianceKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Next key to process; None once the queue is shut down
    pub async fn get(&self) -> Option<ApplianceKey> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = lock(&self.inner);
                if inner.shutting_down {
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release a key handed out by `get`
    pub fn done(&self, key: &ApplianceKey) {
        let mut inner = lock(&self.inner);
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying it
    pub fn next_retry_delay(&self, key: &ApplianceKey) -> Duration {
        let mut inner = lock(&self.inner);
        let failures = inner.failures.entry(key.clone()).or_insert(0);
        let delay = exponential_delay(self.retry_base_delay, self.retry_max_delay, 2.0, *failures);
        *failures = failures.saturating_add(1);
        delay
    }

    /// Clear the failure history for `key`
    pub fn forget(&self, key: &ApplianceKey) {
        lock(&self.inner).failures.remove(key);
    }

    pub fn failures(&self, key: &ApplianceKey) -> u32 {
        lock(&self.inner).failures.get(key).copied().unwrap_or(0)
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        lock(&self.inner).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every waiting worker and refuse new work
    pub fn shut_down(&self) {
        lock(&self.inner).shutting_down = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ApplianceKey {
        ApplianceKey::new("default", name)
    }

    fn queue() -> WorkQueue {
        WorkQueue::new(Duration::from_millis(100), Duration::from_millis(1000))
    }

    #[tokio::test]
    async fn test_pending_keys_are_deduplicated() {
        let queue = queue();
        assert!(queue.add(key("a")));
        assert!(!queue.add(key("a")));
        assert!(queue.add(key("b")));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("b")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_key_readded_while_processing_waits_for_done() {
        let queue = queue();
        queue.add(key("a"));
        let held = queue.get().await.unwrap();

        assert!(queue.add(key("a")));
        assert!(queue.is_empty(), "a processing key must not be handed out twice");

        queue.done(&held);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key("a")));
    }

    #[tokio::test]
    async fn test_done_without_readd_leaves_queue_empty() {
        let queue = queue();
        queue.add(key("a"));
        let held = queue.get().await.unwrap();
        queue.done(&held);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let queue = Arc::new(queue());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.add(key("late"));
        assert_eq!(waiter.await.unwrap(), Some(key("late")));
    }

    #[tokio::test]
    async fn test_shut_down_releases_waiters() {
        let queue = Arc::new(queue());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
        assert!(!queue.add(key("a")));
    }

    #[tokio::test]
    async fn test_retry_delay_doubles_and_resets() {
        let queue = queue();
        let delays: Vec<u64> = (0..5)
            .map(|_| queue.next_retry_delay(&key("a")).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000]);
        assert_eq!(queue.failures(&key("a")), 5);
        assert_eq!(queue.next_retry_delay(&key("b")), Duration::from_millis(100));

        queue.forget(&key("a"));
        assert_eq!(queue.failures(&key("a")), 0);
        assert_eq!(queue.next_retry_delay(&key("a")), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_add_after_delays_requeue() {
        let queue = Arc::new(queue());
        queue.add_after(key("a"), Duration::from_millis(30));
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(queue.len(), 1);
    }
}
