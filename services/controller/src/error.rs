//! Error types for the controller's collaborators and the reconciler.

use meshroute_resources::{BindingError, ObjectKey};
use thiserror::Error;

/// Target store errors. All of them are transient from the reconciler's
/// point of view: the store, or the object in it, may change.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The target resource does not exist (yet).
    #[error("target {0} not found")]
    NotFound(ObjectKey),

    /// The target changed since it was read.
    #[error("target {0} was modified concurrently")]
    Conflict(ObjectKey),

    /// The store could not be reached.
    #[error("target store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the request.
    #[error("target store rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The stored object could not be decoded or encoded.
    #[error("invalid target object: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Watch source errors. Any of them makes the informer re-list.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source could not be reached or the connection broke.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The watch position is too old to resume from.
    #[error("watch expired: {0}")]
    Expired(String),

    /// A source object could not be decoded.
    #[error("invalid source object: {0}")]
    Decode(String),
}

/// Why a reconciliation did not complete.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The source entity carries malformed routing data.
    #[error(transparent)]
    Binding(#[from] BindingError),

    /// The target store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    /// Returns true if retrying later may succeed.
    ///
    /// Malformed input is permanent until the entity itself changes, which
    /// produces a fresh notification anyway.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}
