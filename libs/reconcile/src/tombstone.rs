//! Last-known state of deleted objects.
//!
//! A delete notification removes the object from the live cache before the
//! reconciler gets to it, yet the reconciler still needs the object's data
//! to undo its effects. The index keeps that state until the delete has been
//! reconciled and the entry is forgotten. The same applies to an object
//! whose update retargets it: the superseded state is kept until its
//! effects have been undone.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

use crate::{read, write};

/// Concurrent map of deleted objects by key.
#[derive(Debug)]
pub struct TombstoneIndex<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for TombstoneIndex<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> TombstoneIndex<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the last known state of `key`, replacing any earlier record.
    pub fn record(&self, key: K, last_known: V) {
        write(&self.entries).insert(key, last_known);
    }

    /// Record `state` only if nothing is recorded for `key` yet. Returns
    /// true if it was recorded.
    ///
    /// An earlier record describes state whose effects have not been
    /// undone yet, so it must not be overwritten.
    pub fn record_if_absent(&self, key: K, state: V) -> bool {
        match write(&self.entries).entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(state);
                true
            }
        }
    }

    /// Last known state of `key`, if it was recorded.
    pub fn lookup(&self, key: &K) -> Option<V> {
        read(&self.entries).get(key).cloned()
    }

    /// Drop the record for `key`. Returns true if one existed.
    pub fn forget(&self, key: &K) -> bool {
        write(&self.entries).remove(key).is_some()
    }

    /// Drop the record for `key` only if it still equals `expected`.
    ///
    /// A newer delete may have replaced the record while the older one was
    /// being reconciled; that record must survive.
    pub fn forget_exact(&self, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let mut entries = write(&self.entries);
        if entries.get(key) == Some(expected) {
            entries.remove(key);
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
