//! Turns change events into queued reconciliation keys.

use std::sync::Arc;

use meshroute_reconcile::{TombstoneIndex, WorkQueue};
use meshroute_resources::{ObjectKey, SourceEntity};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::informer::ChangeEvent;
use crate::routes::RouteSettings;

pub type Tombstones = TombstoneIndex<ObjectKey, SourceEntity>;

/// Feeds the work queue from the informer's change events.
#[derive(Clone)]
pub struct EventHandler {
    queue: WorkQueue<ObjectKey>,
    tombstones: Arc<Tombstones>,
    settings: RouteSettings,
}

impl EventHandler {
    pub fn new(
        queue: WorkQueue<ObjectKey>,
        tombstones: Arc<Tombstones>,
        settings: RouteSettings,
    ) -> Self {
        Self {
            queue,
            tombstones,
            settings,
        }
    }

    /// Enqueue the key behind `change`.
    ///
    /// State whose route has to be undone (a deleted service, or the old
    /// side of a binding change) is recorded as a tombstone before the key
    /// is queued. An existing tombstone is never overwritten: it still
    /// names the virtual service holding the route.
    pub fn handle(&self, change: ChangeEvent) {
        let key = change.key().clone();
        info!(key = %key, change = change.kind(), "service changed");

        match change {
            ChangeEvent::Added(_) => {}
            ChangeEvent::Updated { old, new } => {
                if let Ok(previous) = self.settings.binding(&old) {
                    if self.settings.binding(&new).ok().as_ref() != Some(&previous)
                        && self.tombstones.record_if_absent(key.clone(), old)
                    {
                        info!(key = %key, previous = %previous, "service binding changed");
                    }
                }
            }
            ChangeEvent::Deleted(entity) => {
                self.tombstones.record_if_absent(key.clone(), entity);
            }
        }

        self.queue.add(key);
        debug!(queue_len = self.queue.len(), "queue depth");
    }

    /// Handle events until the channel closes.
    pub async fn run(self, mut events: mpsc::Receiver<ChangeEvent>) {
        while let Some(change) = events.recv().await {
            self.handle(change);
        }
        debug!("event channel closed");
    }
}
