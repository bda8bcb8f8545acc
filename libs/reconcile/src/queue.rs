//! Deduplicating, rate-limited work queue.
//!
//! Items are identity keys, not events: reconciliation always reads current
//! state, so coalescing repeated adds never loses information.
//!
//! Guarantees:
//! - An item added while already pending is stored once.
//! - An item added while being processed is held back until `done` is
//!   called for it, then delivered once more. No two workers ever hold the
//!   same item at the same time.
//! - After `shut_down`, `get` returns `None` and adds are dropped.

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::{lock, RateLimiter};

#[derive(Debug)]
struct State<K> {
    /// Items ready to be handed out, in order.
    queue: VecDeque<K>,

    /// Items that need processing (queued or waiting on an in-flight copy).
    dirty: HashSet<K>,

    /// Items currently held by a worker.
    processing: HashSet<K>,

    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,

    /// Signalled when an item becomes available or on shutdown.
    available: Notify,

    /// Signalled when the last in-flight item completes during shutdown.
    drained: Notify,

    limiter: Box<dyn RateLimiter<K>>,
}

/// Multi-producer, multi-consumer queue of keys pending reconciliation.
///
/// Cloning yields another handle to the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create a queue whose failed items are delayed by `limiter`.
    pub fn new(limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                drained: Notify::new(),
                limiter: Box::new(limiter),
            }),
        }
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: K) {
        let mut state = lock(&self.inner.state);
        if state.shutting_down {
            trace!(key = ?key, "queue shutting down, dropping add");
            return;
        }

        if !state.dirty.insert(key.clone()) {
            trace!(key = ?key, "already pending, coalesced");
            return;
        }

        if state.processing.contains(&key) {
            trace!(key = ?key, "in flight, deferring until done");
            return;
        }

        state.queue.push_back(key);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        if self.is_shutting_down() {
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Re-add a failed `key` after the limiter's backoff.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.when(&key);
        debug!(
            key = ?key,
            delay_ms = delay.as_millis() as u64,
            requeues = self.inner.limiter.num_requeues(&key),
            "requeueing with backoff"
        );
        self.add_after(key, delay);
    }

    /// Reset the backoff for `key`.
    pub fn forget(&self, key: &K) {
        self.inner.limiter.forget(key);
    }

    /// Failures recorded for `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is shut down. Every `Some(key)` must be
    /// followed by exactly one [`done`](Self::done) for that key.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.available.notified();

            {
                let mut state = lock(&self.inner.state);
                if state.shutting_down {
                    return None;
                }

                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as no longer being processed.
    ///
    /// If it was re-added in the meantime it becomes available again.
    pub fn done(&self, key: &K) {
        let mut state = lock(&self.inner.state);
        state.processing.remove(key);

        if state.shutting_down {
            if state.processing.is_empty() {
                self.inner.drained.notify_waiters();
            }
            return;
        }

        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.available.notify_one();
        }
    }

    /// Stop handing out work. Pending items are dropped.
    pub fn shut_down(&self) {
        let mut state = lock(&self.inner.state);
        state.shutting_down = true;
        state.queue.clear();
        state.dirty.clear();
        let in_flight = state.processing.len();
        drop(state);

        debug!(in_flight, "work queue shutting down");
        self.inner.available.notify_waiters();
    }

    /// Shut down and wait until every in-flight item is done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();

        loop {
            let drained = self.inner.drained.notified();
            if lock(&self.inner.state).processing.is_empty() {
                return;
            }
            drained.await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        lock(&self.inner.state).shutting_down
    }

    /// Number of items ready to be handed out.
    pub fn len(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackoffPolicy, ItemExponentialLimiter};

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(ItemExponentialLimiter::new(BackoffPolicy::exact(
            Duration::from_millis(10),
            Duration::from_secs(1),
        )))
    }

    async fn try_get(q: &WorkQueue<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_millis(50), q.get())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_add_coalesces_pending_items() {
        let q = queue();
        q.add("shop/cart".to_string());
        q.add("shop/cart".to_string());

        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("shop/cart"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_across_keys() {
        let q = queue();
        q.add("a".to_string());
        q.add("b".to_string());
        q.add("a".to_string());

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readd_while_processing_waits_for_done() {
        let q = queue();
        q.add("x".to_string());

        let key = q.get().await.unwrap();
        q.add("x".to_string());
        q.add("x".to_string());

        // Held back while the first copy is in flight.
        assert_eq!(q.len(), 0);
        assert_eq!(try_get(&q).await, None);

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("x"));
        q.done(&key);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_get_wakes_blocked_worker() {
        let q = queue();
        let worker = tokio::spawn({
            let q = q.clone();
            async move { q.get().await }
        });

        tokio::task::yield_now().await;
        q.add("late".to_string());

        assert_eq!(worker.await.unwrap().as_deref(), Some("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_backs_off() {
        let q = queue();
        let key = "x".to_string();

        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 1);
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_millis(11)).await;
        assert_eq!(q.len(), 1);
        let got = q.get().await.unwrap();

        // Second failure waits twice as long.
        q.add_rate_limited(got.clone());
        q.done(&got);
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(q.len(), 1);

        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters_and_drops_adds() {
        let q = queue();
        let worker = tokio::spawn({
            let q = q.clone();
            async move { q.get().await }
        });

        tokio::task::yield_now().await;
        q.shut_down();

        assert_eq!(worker.await.unwrap(), None);
        q.add("ignored".to_string());
        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_with_drain_waits_for_in_flight() {
        let q = queue();
        q.add("busy".to_string());
        let key = q.get().await.unwrap();

        let drain = tokio::spawn({
            let q = q.clone();
            async move { q.shut_down_with_drain().await }
        });

        tokio::task::yield_now().await;
        assert!(!drain.is_finished());

        q.done(&key);
        tokio::time::timeout(Duration::from_secs(1), drain)
            .await
            .expect("drain should complete")
            .unwrap();
    }
}
