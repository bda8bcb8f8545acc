//! Route fragments and prefix-keyed route table operations.
//!
//! The wire shape follows the mesh's HTTP route record (`match`, `rewrite`,
//! `headers`, `route`). Fields this controller does not manage are kept in
//! `extra` maps so that routes written by other actors survive a
//! read-modify-write untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One entry of a target's route table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteFragment {
    #[serde(default, rename = "match", skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<HttpMatchRequest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<HttpRewrite>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub route: Vec<RouteDestination>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RouteFragment {
    /// The URI prefix of the first match clause.
    ///
    /// This is the fragment's identity within a route table.
    pub fn prefix(&self) -> Option<&str> {
        self.matches
            .first()
            .and_then(|m| m.uri.as_ref())
            .and_then(|uri| uri.prefix.as_deref())
    }

    /// The first destination, if any.
    pub fn destination(&self) -> Option<&Destination> {
        self.route.first().map(|r| &r.destination)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpMatchRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<StringMatch>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StringMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRewrite {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<HeaderOperations>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderOperations {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteDestination {
    pub destination: Destination,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSelector>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PortSelector {
    /// Select a port by number.
    pub fn new(number: u32) -> Self {
        Self {
            number: Some(number),
            extra: Map::new(),
        }
    }
}

/// What a route table operation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteChange {
    /// No entry had the prefix; the fragment was appended.
    Appended,
    /// An entry with the prefix was replaced in place.
    Replaced,
    /// Entries with the prefix were removed.
    Removed,
    /// The table already matched.
    Unchanged,
}

impl RouteChange {
    /// Returns true if the table was modified.
    pub fn is_changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Insert or replace the fragment sharing `route`'s prefix.
///
/// The first entry with the prefix is replaced in place and any later
/// duplicates are dropped; with no such entry the fragment is appended.
pub fn upsert_route(routes: &mut Vec<RouteFragment>, route: RouteFragment) -> RouteChange {
    let Some(prefix) = route.prefix().map(str::to_owned) else {
        routes.push(route);
        return RouteChange::Appended;
    };

    let positions: Vec<usize> = routes
        .iter()
        .enumerate()
        .filter(|(_, r)| r.prefix() == Some(prefix.as_str()))
        .map(|(i, _)| i)
        .collect();

    let Some((&first, duplicates)) = positions.split_first() else {
        routes.push(route);
        return RouteChange::Appended;
    };

    for &i in duplicates.iter().rev() {
        routes.remove(i);
    }

    if duplicates.is_empty() && routes[first] == route {
        return RouteChange::Unchanged;
    }

    routes[first] = route;
    RouteChange::Replaced
}

/// Remove every fragment with `prefix`. Absence is not an error.
pub fn remove_route(routes: &mut Vec<RouteFragment>, prefix: &str) -> RouteChange {
    let before = routes.len();
    routes.retain(|r| r.prefix() != Some(prefix));

    if routes.len() == before {
        RouteChange::Unchanged
    } else {
        RouteChange::Removed
    }
}
