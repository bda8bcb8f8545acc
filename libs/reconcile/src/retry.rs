//! Retrying optimistic-concurrency conflicts from a fresh read.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// How often and how fast to retry a conflicting write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRetry {
    /// Total attempts, including the first.
    pub attempts: u32,

    /// Pause between attempts.
    pub interval: Duration,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_millis(10),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the
/// attempts are used up.
///
/// `op` must perform the whole read-modify-write so that each attempt starts
/// from freshly read state. The last conflict is returned on exhaustion.
pub async fn retry_on_conflict<T, E, F, Fut, C>(
    policy: &ConflictRetry,
    is_conflict: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Err(e) if is_conflict(&e) && attempt < attempts => {
                debug!(attempt, attempts, "write conflicted, retrying from fresh read");
                attempt += 1;
                tokio::time::sleep(policy.interval).await;
            }
            result => return result,
        }
    }
}
