//! Reconciliation loop primitives.
//!
//! This library provides the plumbing between change notifications and a
//! level-triggered reconciler. Key concepts:
//!
//! - **Work queue**: deduplicating queue of keys; at most one worker holds a
//!   given key at a time.
//! - **Rate limiting**: failed keys are re-added after an exponential,
//!   capped backoff that resets once the key succeeds.
//! - **Tombstones**: last-known state of deleted objects, kept until their
//!   deletion has been reconciled.
//! - **Conflict retry**: optimistic-concurrency writes are retried from a
//!   fresh read, never blindly overwritten.
//!
//! # Invariants
//!
//! - Reconciliation operates on current state, so coalescing adds is safe
//! - A key is never processed by two workers concurrently
//! - After shutdown no new work is handed out

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

mod backoff;
mod queue;
mod rate_limit;
mod retry;
mod tombstone;

pub use backoff::BackoffPolicy;
pub use queue::WorkQueue;
pub use rate_limit::{
    controller_rate_limiter, BucketLimiter, ItemExponentialLimiter, MaxOfLimiter, RateLimiter,
    DEFAULT_BUCKET_BURST, DEFAULT_BUCKET_QPS, DEFAULT_ITEM_BACKOFF_BASE, DEFAULT_ITEM_BACKOFF_MAX,
};
pub use retry::{retry_on_conflict, ConflictRetry};
pub use tombstone::TombstoneIndex;

// Critical sections never panic mid-update, so a poisoned lock still guards
// consistent data.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
