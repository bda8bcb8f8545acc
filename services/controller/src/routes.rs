//! Route construction for a single service.
//!
//! Every service gets exactly one fragment:
//! - prefix `/<namespace>/<name>`, rewritten to `/`
//! - destination `<name>.<namespace>.svc.<cluster-domain>:<port>`
//! - envoy upstream timing headers stripped from responses

use meshroute_resources::{
    BindingError, Destination, HeaderOperations, Headers, HttpMatchRequest, HttpRewrite,
    ObjectKey, PortSelector, RouteDestination, RouteFragment, RoutePort, SourceEntity,
    StringMatch, TargetBinding,
};

/// Label selecting services and naming their virtual service.
pub const DEFAULT_ROUTE_LABEL: &str = "virtualservice.httproute/VirtualServiceName";

/// Annotation overriding the routed port.
pub const DEFAULT_PORT_ANNOTATION: &str = "virtualservice.httproute/PortNumber";

pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Response headers removed on every generated route.
pub const STRIPPED_RESPONSE_HEADERS: [&str; 2] = [
    "x-envoy-upstream-healthchecked-cluster",
    "x-envoy-upstream-service-time",
];

/// Label and annotation names plus the DNS suffix used to build routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSettings {
    pub route_label: String,
    pub port_annotation: String,
    pub cluster_domain: String,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            route_label: DEFAULT_ROUTE_LABEL.to_string(),
            port_annotation: DEFAULT_PORT_ANNOTATION.to_string(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
        }
    }
}

impl RouteSettings {
    /// The virtual service `entity` routes through.
    pub fn binding(&self, entity: &SourceEntity) -> Result<TargetBinding, BindingError> {
        TargetBinding::from_entity(entity, &self.route_label)
    }

    /// The fragment `entity` should own.
    pub fn route_for(&self, entity: &SourceEntity) -> Result<RouteFragment, BindingError> {
        let port = RoutePort::select(entity, &self.port_annotation)?;
        Ok(build_route(&entity.key, port, &self.cluster_domain))
    }
}

/// `/<namespace>/<name>`, the fragment's identity in the route table.
pub fn route_prefix(key: &ObjectKey) -> String {
    format!("/{}/{}", key.namespace(), key.name())
}

/// Cluster-local DNS name of a service.
pub fn service_host(key: &ObjectKey, cluster_domain: &str) -> String {
    format!("{}.{}.svc.{}", key.name(), key.namespace(), cluster_domain)
}

pub fn build_route(key: &ObjectKey, port: RoutePort, cluster_domain: &str) -> RouteFragment {
    RouteFragment {
        matches: vec![HttpMatchRequest {
            uri: Some(StringMatch {
                prefix: Some(route_prefix(key)),
                ..Default::default()
            }),
            ..Default::default()
        }],
        rewrite: Some(HttpRewrite {
            uri: Some("/".to_string()),
            ..Default::default()
        }),
        headers: Some(Headers {
            response: Some(HeaderOperations {
                remove: STRIPPED_RESPONSE_HEADERS
                    .iter()
                    .map(|h| h.to_string())
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        route: vec![RouteDestination {
            destination: Destination {
                host: service_host(key, cluster_domain),
                port: Some(PortSelector::new(u32::from(port.get()))),
                ..Default::default()
            },
            ..Default::default()
        }],
        ..Default::default()
    }
}
