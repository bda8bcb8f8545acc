//! Target store interface and an in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use meshroute_resources::{ObjectKey, TargetResource};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;

/// Read and conditionally write routing resources.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Fetch the current state of `key`.
    async fn get(&self, key: &ObjectKey) -> Result<TargetResource, StoreError>;

    /// Replace the stored object. Fails with `StoreError::Conflict` unless
    /// `resource.resource_version` still matches the stored version.
    /// Returns the object as stored, carrying its new version.
    async fn update(&self, resource: &TargetResource) -> Result<TargetResource, StoreError>;
}

#[derive(Default)]
struct StoreState {
    objects: HashMap<ObjectKey, TargetResource>,
    version: u64,
    pending_conflicts: u32,
    unavailable: bool,
}

impl StoreState {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// In-memory target store for tests and local development.
///
/// Enforces optimistic concurrency the way the API server does, and can
/// simulate concurrent writers and outages.
#[derive(Default)]
pub struct MemoryTargetStore {
    state: Mutex<StoreState>,
    gets: AtomicU64,
    updates: AtomicU64,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `resource` unconditionally, returning it with its new version.
    pub async fn insert(&self, mut resource: TargetResource) -> TargetResource {
        let mut state = self.state.lock().await;
        resource.resource_version = Some(state.next_version());
        state
            .objects
            .insert(resource.key.clone(), resource.clone());
        resource
    }

    /// Current stored state of `key`, bypassing counters and failures.
    pub async fn snapshot(&self, key: &ObjectKey) -> Option<TargetResource> {
        self.state.lock().await.objects.get(key).cloned()
    }

    /// Make the next `n` updates conflict, as if another writer got there
    /// first. The stored version is bumped on each injected conflict.
    pub async fn inject_conflicts(&self, n: u32) {
        self.state.lock().await.pending_conflicts = n;
    }

    /// Fail every call with `StoreError::Unavailable` while set.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Number of `get` calls served.
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of successful `update` calls.
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn get(&self, key: &ObjectKey) -> Result<TargetResource, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }

        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn update(&self, resource: &TargetResource) -> Result<TargetResource, StoreError> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }

        let key = &resource.key;
        let stored_version = state
            .objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?
            .resource_version
            .clone();

        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            let version = state.next_version();
            if let Some(stored) = state.objects.get_mut(key) {
                stored.resource_version = Some(version);
            }
            debug!(key = %key, "injected write conflict");
            return Err(StoreError::Conflict(key.clone()));
        }

        if resource.resource_version != stored_version {
            return Err(StoreError::Conflict(key.clone()));
        }

        let mut stored = resource.clone();
        stored.resource_version = Some(state.next_version());
        state.objects.insert(key.clone(), stored.clone());
        self.updates.fetch_add(1, Ordering::SeqCst);

        Ok(stored)
    }
}
