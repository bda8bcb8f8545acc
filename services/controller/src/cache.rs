//! Local mirror of watched services.
//!
//! Uses ArcSwap for lock-free reads: workers load a consistent snapshot
//! without blocking the informer, and the informer swaps in a new snapshot
//! per change. Only the informer writes.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use meshroute_resources::{ObjectKey, SourceEntity};

type Snapshot = HashMap<ObjectKey, SourceEntity>;

/// Eventually consistent view of every service matching the selector.
pub struct SourceCache {
    snapshot: ArcSwap<Snapshot>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::new()),
        }
    }

    /// Current state of `key`, if it is cached.
    pub fn get(&self, key: &ObjectKey) -> Option<SourceEntity> {
        self.snapshot.load().get(key).cloned()
    }

    /// All cached keys, sorted.
    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self.snapshot.load().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    /// Insert or replace an entity, returning the previous state.
    pub(crate) fn upsert(&self, entity: SourceEntity) -> Option<SourceEntity> {
        let key = entity.key.clone();
        let previous = self.snapshot.rcu(|current| {
            let mut next = Snapshot::clone(current);
            next.insert(entity.key.clone(), entity.clone());
            next
        });
        previous.get(&key).cloned()
    }

    /// Remove an entity, returning its last state.
    pub(crate) fn remove(&self, key: &ObjectKey) -> Option<SourceEntity> {
        let previous = self.snapshot.rcu(|current| {
            let mut next = Snapshot::clone(current);
            next.remove(key);
            next
        });
        previous.get(key).cloned()
    }

    /// Replace the whole contents, returning the previous snapshot.
    pub(crate) fn replace(&self, entities: Vec<SourceEntity>) -> Arc<Snapshot> {
        let next: Snapshot = entities
            .into_iter()
            .map(|e| (e.key.clone(), e))
            .collect();
        self.snapshot.swap(Arc::new(next))
    }
}

impl Default for SourceCache {
    fn default() -> Self {
        Self::new()
    }
}
