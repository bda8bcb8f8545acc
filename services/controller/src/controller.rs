//! Controller wiring and worker loops.
//!
//! ```text
//!  WatchSource ──▶ Informer ──▶ SourceCache
//!                     │
//!                ChangeEvent (mpsc)
//!                     ▼
//!               EventHandler ──▶ TombstoneIndex
//!                     │
//!                     ▼
//!                 WorkQueue ◀──── resync (optional)
//!                     │
//!           ┌─────────┼─────────┐
//!           ▼         ▼         ▼
//!        worker    worker    worker ──▶ Reconciler ──▶ TargetStore
//! ```

use std::sync::Arc;
use std::time::Duration;

use meshroute_reconcile::{
    controller_rate_limiter, BackoffPolicy, ConflictRetry, WorkQueue, DEFAULT_BUCKET_BURST,
    DEFAULT_BUCKET_QPS, DEFAULT_ITEM_BACKOFF_BASE, DEFAULT_ITEM_BACKOFF_MAX,
};
use meshroute_resources::ObjectKey;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::SourceCache;
use crate::handler::{EventHandler, Tombstones};
use crate::informer::Informer;
use crate::reconciler::Reconciler;
use crate::routes::RouteSettings;
use crate::source::WatchSource;
use crate::store::TargetStore;

/// External collaborators, passed in at construction.
#[derive(Clone)]
pub struct ControllerContext {
    pub source: Arc<dyn WatchSource>,
    pub store: Arc<dyn TargetStore>,
    pub settings: RouteSettings,
}

/// Controller tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Number of concurrent worker loops.
    pub workers: usize,

    /// Per-key backoff for failed reconciliations.
    pub item_backoff: BackoffPolicy,

    /// Overall requeue rate shared by all keys.
    pub queue_qps: f64,
    pub queue_burst: u32,

    /// Backoff between failed list/watch cycles.
    pub relist_backoff: BackoffPolicy,

    /// Re-enqueue every cached key at this interval, if set.
    pub resync_interval: Option<Duration>,

    /// In-process retry of conflicting writes.
    pub conflict_retry: ConflictRetry,

    /// Capacity of the informer's event channel.
    pub event_buffer: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            item_backoff: BackoffPolicy::exact(DEFAULT_ITEM_BACKOFF_BASE, DEFAULT_ITEM_BACKOFF_MAX),
            queue_qps: DEFAULT_BUCKET_QPS,
            queue_burst: DEFAULT_BUCKET_BURST,
            relist_backoff: BackoffPolicy::default(),
            resync_interval: None,
            conflict_retry: ConflictRetry::default(),
            event_buffer: 256,
        }
    }
}

/// Keeps virtual service route tables in line with labelled services.
pub struct Controller {
    source: Arc<dyn WatchSource>,
    selector: String,
    settings: RouteSettings,
    config: ControllerConfig,
    cache: Arc<SourceCache>,
    tombstones: Arc<Tombstones>,
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<Reconciler>,
}

impl Controller {
    pub fn new(context: ControllerContext, config: ControllerConfig) -> Self {
        let cache = Arc::new(SourceCache::new());
        let tombstones = Arc::new(Tombstones::new());
        let queue = WorkQueue::new(controller_rate_limiter(
            config.item_backoff.clone(),
            config.queue_qps,
            config.queue_burst,
        ));

        let selector = context.settings.route_label.clone();
        let settings = context.settings.clone();
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&cache),
            Arc::clone(&tombstones),
            context.store,
            context.settings,
            config.conflict_retry.clone(),
        ));

        Self {
            source: context.source,
            selector,
            settings,
            config,
            cache,
            tombstones,
            queue,
            reconciler,
        }
    }

    pub fn cache(&self) -> &Arc<SourceCache> {
        &self.cache
    }

    pub fn tombstones(&self) -> &Arc<Tombstones> {
        &self.tombstones
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Run until `shutdown` turns true, then stop handing out work and wait
    /// for in-flight reconciliations to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let workers = self.config.workers.max(1);
        info!(
            workers,
            selector = %self.selector,
            resync_secs = self.config.resync_interval.map(|d| d.as_secs()),
            "controller starting"
        );

        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let informer = Informer::new(
            Arc::clone(&self.source),
            Arc::clone(&self.cache),
            self.selector.clone(),
            events_tx,
            self.config.relist_backoff.clone(),
        );

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
        tasks.push(("informer", tokio::spawn(informer.run(shutdown.clone()))));

        let handler = EventHandler::new(
            self.queue.clone(),
            Arc::clone(&self.tombstones),
            self.settings.clone(),
        );
        tasks.push(("handler", tokio::spawn(handler.run(events_rx))));

        for id in 0..workers {
            let queue = self.queue.clone();
            let reconciler = Arc::clone(&self.reconciler);
            tasks.push(("worker", tokio::spawn(run_worker(id, queue, reconciler))));
        }

        if let Some(interval) = self.config.resync_interval {
            let task = run_resync(
                interval,
                Arc::clone(&self.cache),
                self.queue.clone(),
                shutdown.clone(),
            );
            tasks.push(("resync", tokio::spawn(task)));
        }

        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!(
            pending = self.queue.len(),
            "controller shutting down, draining in-flight work"
        );
        self.queue.shut_down_with_drain().await;

        for (name, task) in tasks {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "controller task failed");
            }
        }

        info!("controller stopped");
    }
}

/// Process keys until the queue shuts down.
async fn run_worker(id: usize, queue: WorkQueue<ObjectKey>, reconciler: Arc<Reconciler>) {
    debug!(worker = id, "worker started");

    while let Some(key) = queue.get().await {
        match reconciler.process(&key).await {
            Ok(outcome) => {
                queue.forget(&key);
                debug!(worker = id, key = %key, outcome = ?outcome, "reconciled");
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    worker = id,
                    key = %key,
                    error = %e,
                    requeues = queue.num_requeues(&key),
                    "reconcile failed, will retry"
                );
                queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                error!(worker = id, key = %key, error = %e, "reconcile failed permanently");
                queue.forget(&key);
            }
        }
        queue.done(&key);
    }

    debug!(worker = id, "worker stopped");
}

/// Periodically re-enqueue every cached key.
async fn run_resync(
    interval: Duration,
    cache: Arc<SourceCache>,
    queue: WorkQueue<ObjectKey>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let keys = cache.keys();
                debug!(count = keys.len(), "resync");
                for key in keys {
                    queue.add(key);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
