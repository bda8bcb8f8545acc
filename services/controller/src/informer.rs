//! List-and-watch loop keeping the source cache current.
//!
//! Each cycle lists every matching service, diffs the listing against the
//! cache, then watches from the listing's version until the stream breaks.
//! Every cache mutation is followed by a `ChangeEvent` on the channel; the
//! cache is always updated first, so a consumer never sees an event for
//! state the cache does not yet hold.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::StreamExt;
use meshroute_reconcile::BackoffPolicy;
use meshroute_resources::{ObjectKey, SourceEntity};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cache::SourceCache;
use crate::error::SourceError;
use crate::source::{SourceList, WatchEvent, WatchSource};

/// A change to the cached set of services.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Added(SourceEntity),
    Updated { old: SourceEntity, new: SourceEntity },
    /// Carries the service's last known state.
    Deleted(SourceEntity),
}

impl ChangeEvent {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Self::Added(e) | Self::Deleted(e) => &e.key,
            Self::Updated { new, .. } => &new.key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Updated { .. } => "updated",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// Mirrors the services matching `selector` into a `SourceCache`.
pub struct Informer {
    source: Arc<dyn WatchSource>,
    cache: Arc<SourceCache>,
    selector: String,
    events: mpsc::Sender<ChangeEvent>,
    backoff: BackoffPolicy,
}

impl Informer {
    pub fn new(
        source: Arc<dyn WatchSource>,
        cache: Arc<SourceCache>,
        selector: impl Into<String>,
        events: mpsc::Sender<ChangeEvent>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            source,
            cache,
            selector: selector.into(),
            events,
            backoff,
        }
    }

    /// Run until shutdown is signalled or the event consumer goes away.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(selector = %self.selector, "informer starting");
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() || self.events.is_closed() {
                break;
            }

            let mut progressed = false;
            let result = tokio::select! {
                result = self.list_and_watch(&mut progressed) => result,
                _ = shutdown.changed() => break,
            };

            match result {
                Ok(()) => debug!("watch closed, relisting"),
                Err(e) => warn!(error = %e, failures, "list/watch failed"),
            }

            if progressed {
                failures = 0;
                continue;
            }

            let delay = self.backoff.delay(failures);
            failures = failures.saturating_add(1);
            debug!(delay_ms = delay.as_millis() as u64, "backing off before relist");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("informer stopped");
    }

    /// One list followed by one watch. Sets `progressed` once the watch has
    /// delivered anything or ended without an error, either of which marks
    /// the connection as healthy.
    async fn list_and_watch(&self, progressed: &mut bool) -> Result<(), SourceError> {
        let list = self.source.list(&self.selector).await?;
        let resource_version = list.resource_version.clone();
        if !self.sync(list).await {
            return Ok(());
        }

        let mut stream = self.source.watch(&self.selector, &resource_version).await?;
        while let Some(event) = stream.next().await {
            let event = event?;
            *progressed = true;

            let change = match event {
                WatchEvent::Added(entity) | WatchEvent::Modified(entity) => {
                    match self.cache.upsert(entity.clone()) {
                        Some(old) => ChangeEvent::Updated { old, new: entity },
                        None => ChangeEvent::Added(entity),
                    }
                }
                WatchEvent::Deleted(entity) => {
                    self.cache.remove(&entity.key);
                    ChangeEvent::Deleted(entity)
                }
                WatchEvent::Bookmark(version) => {
                    debug!(resource_version = %version, "watch bookmark");
                    continue;
                }
            };

            if !self.emit(change).await {
                return Ok(());
            }
        }

        // Servers close idle watches on a timeout.
        *progressed = true;
        Ok(())
    }

    /// Replace the cache with a fresh listing and emit the difference.
    /// Keys present before and after are reported as updates, so a relist
    /// doubles as a resync. Returns false if the consumer is gone.
    async fn sync(&self, list: SourceList) -> bool {
        let listed: HashSet<ObjectKey> = list.items.iter().map(|e| e.key.clone()).collect();
        let previous = self.cache.replace(list.items.clone());

        info!(
            items = list.items.len(),
            resource_version = %list.resource_version,
            "listed services"
        );

        for entity in list.items {
            let change = match previous.get(&entity.key) {
                Some(old) => ChangeEvent::Updated {
                    old: old.clone(),
                    new: entity,
                },
                None => ChangeEvent::Added(entity),
            };
            if !self.emit(change).await {
                return false;
            }
        }

        for (key, old) in previous.iter() {
            if !listed.contains(key) && !self.emit(ChangeEvent::Deleted(old.clone())).await {
                return false;
            }
        }

        true
    }

    async fn emit(&self, change: ChangeEvent) -> bool {
        self.events.send(change).await.is_ok()
    }
}
