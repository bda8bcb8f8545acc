//! Target routing resources.

use serde_json::Value;

use crate::{ObjectKey, RouteFragment};

/// A routing resource holding an ordered route table.
///
/// Mutated only through full read-modify-write cycles. `resource_version`
/// is the opaque token the store uses to reject stale writes.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetResource {
    pub key: ObjectKey,

    /// Version token observed on read; `None` for objects never stored.
    pub resource_version: Option<String>,

    /// Route table, in priority order.
    pub routes: Vec<RouteFragment>,

    /// Rest of the stored object, written back as read.
    pub passthrough: Value,
}

impl TargetResource {
    /// Create an empty resource with no version.
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            resource_version: None,
            routes: Vec::new(),
            passthrough: Value::Null,
        }
    }

    pub fn with_routes(mut self, routes: Vec<RouteFragment>) -> Self {
        self.routes = routes;
        self
    }

    /// Find the fragment with `prefix`.
    pub fn route(&self, prefix: &str) -> Option<&RouteFragment> {
        self.routes.iter().find(|r| r.prefix() == Some(prefix))
    }
}
