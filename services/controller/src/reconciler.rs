//! Level-triggered reconciliation of one service's route.
//!
//! Given a key, the reconciler works out what the route table of the
//! service's virtual service should contain and applies the difference with
//! a read-modify-write against the target store:
//!
//! 1. A cached service gets its fragment inserted or replaced by prefix,
//!    after any fragment left in a previously bound virtual service is
//!    removed.
//! 2. A tombstoned service gets every fragment with its prefix removed.
//! 3. A key known to neither is already converged.
//!
//! Each attempt starts from a fresh read, and the write is conditional on
//! the version read, so concurrent writers are never overwritten.

use std::sync::Arc;

use meshroute_reconcile::{retry_on_conflict, ConflictRetry};
use meshroute_resources::{
    remove_route, upsert_route, ObjectKey, RouteChange, RouteFragment, SourceEntity,
    TargetBinding,
};
use tracing::{debug, info, instrument};

use crate::cache::SourceCache;
use crate::error::{ReconcileError, StoreError};
use crate::handler::Tombstones;
use crate::routes::{route_prefix, RouteSettings};
use crate::store::TargetStore;

/// What a successful reconciliation did to the route table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The fragment was appended.
    Created,
    /// The fragment was replaced in place.
    Updated,
    /// The fragment was removed.
    Removed,
    /// The table already matched; nothing was written.
    Unchanged,
    /// The service is gone and left no tombstone.
    Absent,
}

impl From<RouteChange> for Outcome {
    fn from(change: RouteChange) -> Self {
        match change {
            RouteChange::Appended => Self::Created,
            RouteChange::Replaced => Self::Updated,
            RouteChange::Removed => Self::Removed,
            RouteChange::Unchanged => Self::Unchanged,
        }
    }
}

pub struct Reconciler {
    cache: Arc<SourceCache>,
    tombstones: Arc<Tombstones>,
    store: Arc<dyn TargetStore>,
    settings: RouteSettings,
    conflict_retry: ConflictRetry,
}

impl Reconciler {
    pub fn new(
        cache: Arc<SourceCache>,
        tombstones: Arc<Tombstones>,
        store: Arc<dyn TargetStore>,
        settings: RouteSettings,
        conflict_retry: ConflictRetry,
    ) -> Self {
        Self {
            cache,
            tombstones,
            store,
            settings,
            conflict_retry,
        }
    }

    /// Bring the route for `key` in line with the service's current state.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn process(&self, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        if let Some(entity) = self.cache.get(key) {
            return self.reconcile_present(key, &entity).await;
        }

        let Some(entity) = self.tombstones.lookup(key) else {
            debug!("service gone without tombstone, nothing to do");
            return Ok(Outcome::Absent);
        };

        let result = self.reconcile_deleted(&entity).await;
        let settled = match &result {
            Ok(_) => true,
            Err(e) => !e.is_retryable(),
        };
        // A newer delete may have replaced the tombstone meanwhile.
        if settled && self.tombstones.forget_exact(key, &entity) {
            debug!("tombstone forgotten");
        }

        result
    }

    async fn reconcile_present(
        &self,
        key: &ObjectKey,
        entity: &SourceEntity,
    ) -> Result<Outcome, ReconcileError> {
        let binding = self.settings.binding(entity);

        // A tombstone on a live service is the state before a binding
        // change; its route goes before the new one is placed.
        if let Some(previous) = self.tombstones.lookup(key) {
            self.retire(key, &previous, binding.as_ref().ok()).await?;
        }

        let binding = binding?;
        let route = self.settings.route_for(entity)?;
        let target = binding.target();

        let change = self
            .apply(target, |routes| upsert_route(routes, route.clone()))
            .await?;

        let outcome = Outcome::from(change);
        if change.is_changed() {
            info!(virtual_service = %target, outcome = ?outcome, "route applied");
        } else {
            debug!(virtual_service = %target, "route already current");
        }

        // The service may have been rebound or deleted while this route was
        // written, after the handler last looked for a tombstone.
        let moved = match self.cache.get(key) {
            Some(latest) => self.settings.binding(&latest).ok().as_ref() != Some(&binding),
            None => true,
        };
        if moved && self.tombstones.record_if_absent(key.clone(), entity.clone()) {
            debug!(virtual_service = %target, "service moved during reconcile");
        }

        Ok(outcome)
    }

    /// Remove the route `previous` placed, unless it lives in `current`,
    /// then drop the tombstone.
    async fn retire(
        &self,
        key: &ObjectKey,
        previous: &SourceEntity,
        current: Option<&TargetBinding>,
    ) -> Result<(), ReconcileError> {
        // A malformed old binding never received a route.
        if let Ok(old) = self.settings.binding(previous) {
            if current != Some(&old) {
                let prefix = route_prefix(key);
                match self
                    .apply(old.target(), |routes| remove_route(routes, &prefix))
                    .await
                {
                    Ok(change) if change.is_changed() => {
                        info!(
                            virtual_service = %old.target(),
                            prefix = %prefix,
                            "stale route removed"
                        );
                    }
                    Ok(_) => {}
                    // Gone along with the virtual service.
                    Err(StoreError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if self.tombstones.forget_exact(key, previous) {
            debug!("tombstone forgotten");
        }
        Ok(())
    }

    async fn reconcile_deleted(&self, entity: &SourceEntity) -> Result<Outcome, ReconcileError> {
        // Deletes need only the binding; a bad port annotation is irrelevant.
        let binding = self.settings.binding(entity)?;
        let target = binding.target();
        let prefix = route_prefix(&entity.key);

        let change = self
            .apply(target, |routes| remove_route(routes, &prefix))
            .await?;

        let outcome = Outcome::from(change);
        if change.is_changed() {
            info!(virtual_service = %target, prefix = %prefix, "route removed");
        } else {
            debug!(virtual_service = %target, prefix = %prefix, "route already absent");
        }
        Ok(outcome)
    }

    /// Read `target`, edit its routes, and write it back if they changed.
    /// Conflicts restart from a fresh read.
    async fn apply<F>(&self, target: &ObjectKey, edit: F) -> Result<RouteChange, StoreError>
    where
        F: Fn(&mut Vec<RouteFragment>) -> RouteChange,
    {
        let edit = &edit;
        let store = self.store.as_ref();

        retry_on_conflict(
            &self.conflict_retry,
            StoreError::is_conflict,
            move || async move {
                let mut resource = store.get(target).await?;
                let change = edit(&mut resource.routes);
                if change.is_changed() {
                    store.update(&resource).await?;
                }
                Ok::<_, StoreError>(change)
            },
        )
        .await
    }
}
