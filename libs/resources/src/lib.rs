//! # meshroute-resources
//!
//! Strongly typed records exchanged between the watch layer, the reconciler
//! and the target store.
//!
//! ## Records
//!
//! - [`ObjectKey`]: `namespace/name` identity shared by every record
//! - [`SourceEntity`]: a watched service, decoded once at the watch boundary
//! - [`TargetResource`]: the routing resource whose route table is kept in sync
//! - [`RouteFragment`]: one prefix-matched entry of that route table
//!
//! Route tables are keyed by prefix, never by position: [`upsert_route`] and
//! [`remove_route`] keep at most one fragment per prefix.

mod binding;
mod error;
mod key;
mod route;
mod source;
mod target;

pub use binding::{RoutePort, TargetBinding};
pub use error::{BindingError, KeyError};
pub use key::ObjectKey;
pub use route::{
    remove_route, upsert_route, Destination, HeaderOperations, Headers, HttpMatchRequest,
    HttpRewrite, PortSelector, RouteChange, RouteDestination, RouteFragment, StringMatch,
};
pub use source::{ServicePort, SourceEntity};
pub use target::TargetResource;
