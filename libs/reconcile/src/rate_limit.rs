//! Requeue rate limiting.
//!
//! A [`RateLimiter`] decides how long a failed item waits before it is
//! re-added to the [`WorkQueue`](crate::WorkQueue). The default controller
//! limiter is the max of a per-item exponential backoff and an overall token
//! bucket, so a single hot item backs off on its own while a burst of
//! failures across many items is still bounded.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::{lock, BackoffPolicy};

/// Decides requeue delays for failed items.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `key` may be retried. Counts as one failure.
    fn when(&self, key: &K) -> Duration;

    /// Stop tracking `key` (it succeeded or was abandoned).
    fn forget(&self, key: &K);

    /// Failures recorded for `key` since it was last forgotten.
    fn num_requeues(&self, key: &K) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped.
pub struct ItemExponentialLimiter<K> {
    policy: BackoffPolicy,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ItemExponentialLimiter<K> {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> Default for ItemExponentialLimiter<K> {
    fn default() -> Self {
        Self::new(BackoffPolicy::exact(
            DEFAULT_ITEM_BACKOFF_BASE,
            DEFAULT_ITEM_BACKOFF_MAX,
        ))
    }
}

impl<K> RateLimiter<K> for ItemExponentialLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    fn when(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(key.clone()).or_insert(0);
        let attempt = *count;
        *count = count.saturating_add(1);
        self.policy.delay(attempt)
    }

    fn forget(&self, key: &K) {
        lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by every item.
///
/// Each `when` reserves one token; once the bucket is empty the returned
/// delay is the time until the reserved token is refilled.
pub struct BucketLimiter {
    qps: f64,
    burst: u32,
    bucket: Mutex<Bucket>,
}

impl BucketLimiter {
    /// A bucket refilling at `qps` tokens per second, holding up to `burst`.
    ///
    /// A non-positive `qps` disables the bucket.
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }
}

impl<K> RateLimiter<K> for BucketLimiter {
    fn when(&self, _key: &K) -> Duration {
        if !self.qps.is_finite() || self.qps <= 0.0 {
            return Duration::ZERO;
        }

        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(f64::from(self.burst));
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

/// Combines limiters, waiting for the slowest.
pub struct MaxOfLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfLimiter<K>
where
    K: Send + Sync,
{
    fn when(&self, key: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Default per-item backoff base.
pub const DEFAULT_ITEM_BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Default per-item backoff cap.
pub const DEFAULT_ITEM_BACKOFF_MAX: Duration = Duration::from_secs(1000);

/// Default overall requeue rate.
pub const DEFAULT_BUCKET_QPS: f64 = 10.0;

/// Default overall requeue burst.
pub const DEFAULT_BUCKET_BURST: u32 = 100;

/// The standard controller limiter: per-item backoff and an overall bucket.
pub fn controller_rate_limiter<K>(
    item_backoff: BackoffPolicy,
    qps: f64,
    burst: u32,
) -> MaxOfLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    MaxOfLimiter::new(vec![
        Box::new(ItemExponentialLimiter::new(item_backoff)),
        Box::new(BucketLimiter::new(qps, burst)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_exponential_backoff() {
        let limiter = ItemExponentialLimiter::<&str>::default();

        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(10));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(20));
        assert_eq!(limiter.num_requeues(&"a"), 3);

        // Other items are tracked independently.
        assert_eq!(limiter.when(&"b"), Duration::from_millis(5));

        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
    }

    #[test]
    fn test_item_backoff_caps() {
        let limiter = ItemExponentialLimiter::<u32>::new(BackoffPolicy::exact(
            Duration::from_millis(1),
            Duration::from_millis(50),
        ));

        let delays: Vec<_> = (0..10).map(|_| limiter.when(&7)).collect();
        assert_eq!(delays.last(), Some(&Duration::from_millis(50)));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_allows_burst_then_spaces() {
        let limiter = BucketLimiter::new(10.0, 2);

        assert_eq!(RateLimiter::<u32>::when(&limiter, &1), Duration::ZERO);
        assert_eq!(RateLimiter::<u32>::when(&limiter, &2), Duration::ZERO);

        let third = RateLimiter::<u32>::when(&limiter, &3);
        assert!(third > Duration::from_millis(90) && third <= Duration::from_millis(100));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(RateLimiter::<u32>::when(&limiter, &4), Duration::ZERO);
    }

    #[test]
    fn test_max_of_takes_slowest() {
        let limiter = controller_rate_limiter::<&str>(
            BackoffPolicy::exact(Duration::from_millis(5), Duration::from_secs(1000)),
            DEFAULT_BUCKET_QPS,
            DEFAULT_BUCKET_BURST,
        );

        // Bucket has plenty of tokens, so the item backoff dominates.
        assert_eq!(limiter.when(&"x"), Duration::from_millis(5));
        assert_eq!(limiter.when(&"x"), Duration::from_millis(10));
        assert_eq!(limiter.num_requeues(&"x"), 2);

        limiter.forget(&"x");
        assert_eq!(limiter.num_requeues(&"x"), 0);
    }
}
