//! Watch source interface and an in-memory implementation.
//!
//! The source lists and watches services matching a label selector. The
//! in-memory source keeps a versioned change history so a watch started at
//! a list's version never misses changes made in between.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use meshroute_resources::{ObjectKey, SourceEntity};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::error::SourceError;

/// A change observed on the watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(SourceEntity),
    Modified(SourceEntity),
    /// Carries the last state the object had while matching the selector.
    Deleted(SourceEntity),
    /// Progress marker carrying a resource version; no object changed.
    Bookmark(String),
}

/// A consistent listing and the version to resume watching from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceList {
    pub items: Vec<SourceEntity>,
    pub resource_version: String,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, SourceError>>;

/// Source of service state.
#[async_trait]
pub trait WatchSource: Send + Sync {
    /// List every service matching `selector`.
    async fn list(&self, selector: &str) -> Result<SourceList, SourceError>;

    /// Stream changes after `resource_version`. The stream ending, or
    /// yielding an error, means the caller must list again.
    async fn watch(&self, selector: &str, resource_version: &str)
        -> Result<WatchStream, SourceError>;
}

/// Label selector match: `key` (exists) or `key=value`.
pub fn selector_matches(selector: &str, entity: &SourceEntity) -> bool {
    match selector.split_once('=') {
        Some((key, value)) => entity.labels.get(key).is_some_and(|v| v == value),
        None => entity.labels.contains_key(selector),
    }
}

#[derive(Debug, Clone)]
struct Change {
    version: u64,
    old: Option<SourceEntity>,
    new: Option<SourceEntity>,
}

impl Change {
    /// The change as seen by a watcher filtering on `selector`.
    fn event_for(&self, selector: &str) -> Option<WatchEvent> {
        let old = self.old.as_ref().filter(|e| selector_matches(selector, e));
        let new = self.new.as_ref().filter(|e| selector_matches(selector, e));

        match (old, new) {
            (None, Some(new)) => Some(WatchEvent::Added(new.clone())),
            (Some(_), Some(new)) => Some(WatchEvent::Modified(new.clone())),
            (Some(old), None) => Some(WatchEvent::Deleted(old.clone())),
            (None, None) => None,
        }
    }
}

struct Watcher {
    selector: String,
    tx: mpsc::UnboundedSender<Result<WatchEvent, SourceError>>,
}

#[derive(Default)]
struct MemoryState {
    items: BTreeMap<ObjectKey, SourceEntity>,
    version: u64,
    history: Vec<Change>,
    watchers: Vec<Watcher>,
    failing_calls: u32,
}

impl MemoryState {
    fn take_failure(&mut self) -> Result<(), SourceError> {
        if self.failing_calls > 0 {
            self.failing_calls -= 1;
            return Err(SourceError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn record(&mut self, old: Option<SourceEntity>, new: Option<SourceEntity>) {
        self.version += 1;
        let change = Change {
            version: self.version,
            old,
            new,
        };

        self.watchers.retain(|w| match change.event_for(&w.selector) {
            Some(event) => w.tx.send(Ok(event)).is_ok(),
            None => !w.tx.is_closed(),
        });
        self.history.push(change);
    }
}

/// In-memory watch source for tests and local development.
#[derive(Default)]
pub struct MemorySource {
    state: Mutex<MemoryState>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a service, stamping a new resource version.
    pub async fn upsert(&self, mut entity: SourceEntity) {
        let mut state = self.state.lock().await;
        entity.resource_version = Some((state.version + 1).to_string());
        let old = state.items.insert(entity.key.clone(), entity.clone());
        state.record(old, Some(entity));
    }

    /// Delete a service. Returns false if it did not exist.
    pub async fn delete(&self, key: &ObjectKey) -> bool {
        let mut state = self.state.lock().await;
        let Some(old) = state.items.remove(key) else {
            return false;
        };
        state.record(Some(old), None);
        true
    }

    /// End every open watch stream, as a dropped connection would.
    pub async fn disconnect_watchers(&self) {
        let mut state = self.state.lock().await;
        debug!(watchers = state.watchers.len(), "disconnecting watchers");
        state.watchers.clear();
    }

    /// Fail the next `n` list or watch calls.
    pub async fn fail_next_calls(&self, n: u32) {
        self.state.lock().await.failing_calls = n;
    }

    pub async fn watcher_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }
}

#[async_trait]
impl WatchSource for MemorySource {
    async fn list(&self, selector: &str) -> Result<SourceList, SourceError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;

        let items = state
            .items
            .values()
            .filter(|e| selector_matches(selector, e))
            .cloned()
            .collect();

        Ok(SourceList {
            items,
            resource_version: state.version.to_string(),
        })
    }

    async fn watch(
        &self,
        selector: &str,
        resource_version: &str,
    ) -> Result<WatchStream, SourceError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;

        let since: u64 = resource_version
            .parse()
            .map_err(|_| SourceError::Expired(format!("bad resource version {resource_version}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        for change in state.history.iter().filter(|c| c.version > since) {
            if let Some(event) = change.event_for(selector) {
                // The receiver is still in scope, so this cannot fail.
                let _ = tx.send(Ok(event));
            }
        }

        state.watchers.push(Watcher {
            selector: selector.to_string(),
            tx,
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LABEL: &str = "routing";

    fn labelled(name: &str) -> SourceEntity {
        SourceEntity::new(ObjectKey::new("shop", name))
            .with_label(LABEL, "edge.vs")
            .with_port(80)
    }

    #[test]
    fn test_selector_matches() {
        let entity = labelled("cart");
        assert!(selector_matches(LABEL, &entity));
        assert!(selector_matches("routing=edge.vs", &entity));
        assert!(!selector_matches("routing=other.vs", &entity));
        assert!(!selector_matches("missing", &entity));
    }

    #[tokio::test]
    async fn test_list_filters_by_selector() {
        let source = MemorySource::new();
        source.upsert(labelled("cart")).await;
        source
            .upsert(SourceEntity::new(ObjectKey::new("shop", "unlabelled")))
            .await;

        let list = source.list(LABEL).await.unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.resource_version, "2");
    }

    #[tokio::test]
    async fn test_watch_replays_changes_after_version() {
        let source = MemorySource::new();
        source.upsert(labelled("cart")).await;
        let list = source.list(LABEL).await.unwrap();

        // Changes between list and watch must not be lost.
        source.upsert(labelled("checkout")).await;
        let mut stream = source.watch(LABEL, &list.resource_version).await.unwrap();
        source.delete(&ObjectKey::new("shop", "cart")).await;

        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, WatchEvent::Added(e) if e.key.name() == "checkout"));
        let second = stream.next().await.unwrap().unwrap();
        assert!(matches!(second, WatchEvent::Deleted(e) if e.key.name() == "cart"));
    }

    #[tokio::test]
    async fn test_label_removal_is_a_delete_with_prior_state() {
        let source = MemorySource::new();
        source.upsert(labelled("cart")).await;
        let mut stream = source.watch(LABEL, "1").await.unwrap();

        source
            .upsert(SourceEntity::new(ObjectKey::new("shop", "cart")).with_port(80))
            .await;

        match stream.next().await.unwrap().unwrap() {
            WatchEvent::Deleted(e) => assert!(e.labels.contains_key(LABEL)),
            other => panic!("Expected Deleted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_ends_streams() {
        let source = MemorySource::new();
        let mut stream = source.watch(LABEL, "0").await.unwrap();
        assert_eq!(source.watcher_count().await, 1);

        source.disconnect_watchers().await;
        assert!(stream.next().await.is_none());
        assert_eq!(source.watcher_count().await, 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let source = MemorySource::new();
        source.fail_next_calls(1).await;

        assert!(source.list(LABEL).await.is_err());
        assert!(source.list(LABEL).await.is_ok());
    }
}
