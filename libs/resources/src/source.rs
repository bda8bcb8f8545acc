//! Watched source entities.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ObjectKey;

/// A declared service port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    /// Optional port name (`http`, `grpc`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Transport protocol (`TCP`, `UDP`, ...).
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Port number as declared by the service.
    pub port: i32,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

impl ServicePort {
    /// A TCP port with no name.
    pub fn tcp(port: i32) -> Self {
        Self {
            name: None,
            protocol: default_protocol(),
            port,
        }
    }
}

/// A watched service, as mirrored by the source cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntity {
    pub key: ObjectKey,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Declared ports, in declaration order.
    #[serde(default)]
    pub ports: Vec<ServicePort>,

    /// Opaque version of the observed object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl SourceEntity {
    /// Create an entity with no labels, annotations or ports.
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            ports: Vec::new(),
            resource_version: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_port(mut self, port: i32) -> Self {
        self.ports.push(ServicePort::tcp(port));
        self
    }
}
