pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod handler;
pub mod informer;
pub mod kube;
pub mod reconciler;
pub mod routes;
pub mod source;
pub mod store;

pub use cache::SourceCache;
pub use config::{ClusterConfig, Config};
pub use controller::{Controller, ControllerConfig, ControllerContext};
pub use error::{ReconcileError, SourceError, StoreError};
pub use handler::{EventHandler, Tombstones};
pub use informer::{ChangeEvent, Informer};
pub use kube::KubeClient;
pub use reconciler::{Outcome, Reconciler};
pub use routes::RouteSettings;
pub use source::{MemorySource, SourceList, WatchEvent, WatchSource, WatchStream};
pub use store::{MemoryTargetStore, TargetStore};
