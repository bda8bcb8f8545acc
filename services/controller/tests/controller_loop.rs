//! End-to-end controller runs against in-memory collaborators.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meshroute_controller::routes::{DEFAULT_PORT_ANNOTATION, DEFAULT_ROUTE_LABEL};
use meshroute_controller::{
    Controller, ControllerConfig, ControllerContext, MemorySource, MemoryTargetStore,
    RouteSettings,
};
use meshroute_reconcile::{BackoffPolicy, WorkQueue};
use meshroute_resources::{ObjectKey, SourceEntity, TargetResource};
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Running {
    source: Arc<MemorySource>,
    store: Arc<MemoryTargetStore>,
    queue: WorkQueue<ObjectKey>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Running {
    async fn start(source: Arc<MemorySource>, store: Arc<MemoryTargetStore>) -> Self {
        let context = ControllerContext {
            source: source.clone(),
            store: store.clone(),
            settings: RouteSettings::default(),
        };
        let config = ControllerConfig {
            workers: 4,
            item_backoff: BackoffPolicy::exact(Duration::from_millis(1), Duration::from_millis(20)),
            relist_backoff: BackoffPolicy::exact(
                Duration::from_millis(1),
                Duration::from_millis(20),
            ),
            ..Default::default()
        };

        let controller = Controller::new(context, config);
        let queue = controller.queue().clone();
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(controller.run(rx));

        Self {
            source,
            store,
            queue,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("controller did not drain")
            .unwrap();
    }

    async fn routes(&self) -> Vec<(String, u32)> {
        self.routes_in(&vs1()).await
    }

    async fn routes_in(&self, target: &ObjectKey) -> Vec<(String, u32)> {
        let Some(resource) = self.store.snapshot(target).await else {
            return Vec::new();
        };
        resource
            .routes
            .iter()
            .filter_map(|r| {
                let prefix = r.prefix()?.to_string();
                let port = r.destination()?.port.as_ref()?.number?;
                Some((prefix, port))
            })
            .collect()
    }

    /// Wait until the route table of vs1 reads `expected`.
    async fn converges_to(&self, expected: &[(&str, u32)]) {
        self.converges_in(&vs1(), expected).await;
    }

    async fn converges_in(&self, target: &ObjectKey, expected: &[(&str, u32)]) {
        let expected: Vec<(String, u32)> = expected
            .iter()
            .map(|(p, n)| (p.to_string(), *n))
            .collect();
        let expected = &expected;
        eventually(move || async move { self.routes_in(target).await == *expected }).await;
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn vs1() -> ObjectKey {
    ObjectKey::new("routing", "vs1")
}

fn service(name: &str, port: i32) -> SourceEntity {
    SourceEntity::new(ObjectKey::new("shop", name))
        .with_label(DEFAULT_ROUTE_LABEL, "routing.vs1")
        .with_port(port)
}

async fn store_with_vs1() -> Arc<MemoryTargetStore> {
    let store = Arc::new(MemoryTargetStore::new());
    store.insert(TargetResource::new(vs1())).await;
    store
}

#[tokio::test]
async fn test_service_lifecycle() {
    let source = Arc::new(MemorySource::new());
    source.upsert(service("cart", 8080)).await;
    let running = Running::start(source, store_with_vs1().await).await;

    running.converges_to(&[("/shop/cart", 8080)]).await;

    running.source.upsert(service("checkout", 80)).await;
    running
        .converges_to(&[("/shop/cart", 8080), ("/shop/checkout", 80)])
        .await;

    // Port override updates the existing fragment in place.
    running
        .source
        .upsert(service("cart", 8080).with_annotation(DEFAULT_PORT_ANNOTATION, "9090"))
        .await;
    running
        .converges_to(&[("/shop/cart", 9090), ("/shop/checkout", 80)])
        .await;

    running.source.delete(&ObjectKey::new("shop", "cart")).await;
    running.converges_to(&[("/shop/checkout", 80)]).await;

    running.stop().await;
}

#[tokio::test]
async fn test_unlabelled_services_are_ignored() {
    let source = Arc::new(MemorySource::new());
    source
        .upsert(SourceEntity::new(ObjectKey::new("shop", "internal")).with_port(80))
        .await;
    source.upsert(service("cart", 8080)).await;
    let running = Running::start(source, store_with_vs1().await).await;

    running.converges_to(&[("/shop/cart", 8080)]).await;
    running.stop().await;
}

#[tokio::test]
async fn test_label_removal_removes_route() {
    let source = Arc::new(MemorySource::new());
    source.upsert(service("cart", 8080)).await;
    let running = Running::start(source, store_with_vs1().await).await;
    running.converges_to(&[("/shop/cart", 8080)]).await;

    running
        .source
        .upsert(SourceEntity::new(ObjectKey::new("shop", "cart")).with_port(8080))
        .await;
    running.converges_to(&[]).await;

    running.stop().await;
}

#[tokio::test]
async fn test_binding_change_moves_route() {
    let vs2 = ObjectKey::new("routing", "vs2");
    let vs3 = ObjectKey::new("routing", "vs3");
    let store = store_with_vs1().await;
    store.insert(TargetResource::new(vs2.clone())).await;
    store.insert(TargetResource::new(vs3.clone())).await;

    let source = Arc::new(MemorySource::new());
    source.upsert(service("cart", 8080)).await;
    source.upsert(service("checkout", 80)).await;
    let running = Running::start(source, store).await;
    running
        .converges_to(&[("/shop/cart", 8080), ("/shop/checkout", 80)])
        .await;

    let rebound = |label: &str| service("cart", 8080).with_label(DEFAULT_ROUTE_LABEL, label);
    running.source.upsert(rebound("routing.vs2")).await;
    running.converges_in(&vs2, &[("/shop/cart", 8080)]).await;
    running.converges_to(&[("/shop/checkout", 80)]).await;

    // Two moves in a row leave the route only in the last target.
    running.source.upsert(rebound("routing.vs1")).await;
    running.source.upsert(rebound("routing.vs3")).await;
    running.converges_in(&vs3, &[("/shop/cart", 8080)]).await;
    running.converges_in(&vs2, &[]).await;
    running.converges_to(&[("/shop/checkout", 80)]).await;

    running.stop().await;
}

#[tokio::test]
async fn test_missing_target_is_retried_until_created() {
    let source = Arc::new(MemorySource::new());
    source.upsert(service("cart", 8080)).await;
    let running = Running::start(source, Arc::new(MemoryTargetStore::new())).await;

    let key = &ObjectKey::new("shop", "cart");
    let queue = &running.queue;
    eventually(move || async move { queue.num_requeues(key) >= 2 }).await;

    running.store.insert(TargetResource::new(vs1())).await;
    running.converges_to(&[("/shop/cart", 8080)]).await;
    eventually(move || async move { queue.num_requeues(key) == 0 }).await;

    running.stop().await;
}

#[tokio::test]
async fn test_conflicts_converge() {
    let source = Arc::new(MemorySource::new());
    let store = store_with_vs1().await;
    store.inject_conflicts(12).await;
    source.upsert(service("cart", 8080)).await;
    source.upsert(service("checkout", 80)).await;

    let running = Running::start(source, store).await;
    let handle = &running;
    eventually(move || async move { handle.routes().await.len() == 2 }).await;

    running.stop().await;
}

#[tokio::test]
async fn test_malformed_label_is_not_retried() {
    let source = Arc::new(MemorySource::new());
    let bad = SourceEntity::new(ObjectKey::new("shop", "broken"))
        .with_label(DEFAULT_ROUTE_LABEL, "badformat")
        .with_port(80);
    source.upsert(bad).await;
    source.upsert(service("cart", 8080)).await;

    let running = Running::start(source, store_with_vs1().await).await;
    running.converges_to(&[("/shop/cart", 8080)]).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        running.queue.num_requeues(&ObjectKey::new("shop", "broken")),
        0
    );
    // Only the valid service ever touched the store.
    assert_eq!(running.store.get_count(), 1);

    running.stop().await;
}

#[tokio::test]
async fn test_watch_disconnect_recovers() {
    let source = Arc::new(MemorySource::new());
    source.upsert(service("cart", 8080)).await;
    let running = Running::start(source, store_with_vs1().await).await;
    running.converges_to(&[("/shop/cart", 8080)]).await;

    running.source.disconnect_watchers().await;
    running.source.delete(&ObjectKey::new("shop", "cart")).await;
    running.source.upsert(service("checkout", 80)).await;

    running.converges_to(&[("/shop/checkout", 80)]).await;
    running.stop().await;
}
