//! Kubernetes API client.
//!
//! Services are listed and watched through the core API; virtual services
//! are read and replaced through the Istio networking API. Watches stream
//! newline-delimited JSON events, decoded here into typed `WatchEvent`s.

use std::collections::BTreeMap;
use std::fs;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use meshroute_resources::{ObjectKey, RouteFragment, ServicePort, SourceEntity, TargetResource};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::error::{SourceError, StoreError};
use crate::source::{SourceList, WatchEvent, WatchSource, WatchStream};
use crate::store::TargetStore;

const VIRTUAL_SERVICE_API: &str = "networking.istio.io/v1alpha3";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default)]
    resource_version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceSpec {
    #[serde(default)]
    ports: Vec<ServicePort>,
}

#[derive(Debug, Deserialize)]
struct ServiceObject {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: ServiceSpec,
}

#[derive(Debug, Deserialize)]
struct ServiceList {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    items: Vec<ServiceObject>,
}

#[derive(Debug, Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: Value,
}

#[derive(Debug, Default, Deserialize)]
struct Status {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

impl TryFrom<ServiceObject> for SourceEntity {
    type Error = SourceError;

    fn try_from(object: ServiceObject) -> Result<Self, Self::Error> {
        let meta = object.metadata;
        let (Some(namespace), Some(name)) = (meta.namespace, meta.name) else {
            return Err(SourceError::Decode(
                "service without namespace or name".to_string(),
            ));
        };

        Ok(SourceEntity {
            key: ObjectKey::new(namespace, name),
            labels: meta.labels,
            annotations: meta.annotations,
            ports: object.spec.ports,
            resource_version: meta.resource_version,
        })
    }
}

fn decode_service(object: Value) -> Result<SourceEntity, SourceError> {
    let object: ServiceObject =
        serde_json::from_value(object).map_err(|e| SourceError::Decode(e.to_string()))?;
    SourceEntity::try_from(object)
}

/// Decode one line of a watch response.
pub(crate) fn decode_watch_line(line: &str) -> Result<WatchEvent, SourceError> {
    let event: RawWatchEvent =
        serde_json::from_str(line).map_err(|e| SourceError::Decode(e.to_string()))?;

    match event.kind.as_str() {
        "ADDED" => Ok(WatchEvent::Added(decode_service(event.object)?)),
        "MODIFIED" => Ok(WatchEvent::Modified(decode_service(event.object)?)),
        "DELETED" => Ok(WatchEvent::Deleted(decode_service(event.object)?)),
        "BOOKMARK" => {
            let object: ServiceObject = serde_json::from_value(event.object)
                .map_err(|e| SourceError::Decode(e.to_string()))?;
            Ok(WatchEvent::Bookmark(
                object.metadata.resource_version.unwrap_or_default(),
            ))
        }
        "ERROR" => {
            let status: Status = serde_json::from_value(event.object).unwrap_or_default();
            if status.code == StatusCode::GONE.as_u16() {
                Err(SourceError::Expired(status.message))
            } else {
                Err(SourceError::Unavailable(format!(
                    "watch error (code={}): {}",
                    status.code, status.message
                )))
            }
        }
        other => Err(SourceError::Decode(format!("unknown watch event type {other}"))),
    }
}

struct LineReader {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: Vec<u8>,
    finished: bool,
}

impl LineReader {
    /// Next complete, non-blank line. A trailing line without a newline is
    /// returned once the body ends.
    async fn next_line(&mut self) -> Option<Result<String, SourceError>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                return Some(Ok(line));
            }

            if self.finished {
                return None;
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.finished = true;
                    self.buffer.clear();
                    return Some(Err(SourceError::Unavailable(e.to_string())));
                }
                None => {
                    self.finished = true;
                    self.buffer.push(b'\n');
                }
            }
        }
    }
}

fn watch_stream(response: Response) -> WatchStream {
    let reader = LineReader {
        body: response.bytes_stream().boxed(),
        buffer: Vec::new(),
        finished: false,
    };

    stream::unfold(reader, |mut reader| async move {
        let line = reader.next_line().await?;
        let event = line.and_then(|line| decode_watch_line(&line));
        Some((event, reader))
    })
    .boxed()
}

/// Split a stored virtual service into its route table and the rest.
pub(crate) fn decode_target(key: &ObjectKey, object: Value) -> Result<TargetResource, StoreError> {
    let resource_version = object
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
        .map(str::to_owned);

    let routes: Vec<RouteFragment> = match object.pointer("/spec/http") {
        Some(Value::Null) | None => Vec::new(),
        Some(http) => serde_json::from_value(http.clone())
            .map_err(|e| StoreError::Decode(format!("spec.http of {key}: {e}")))?,
    };

    Ok(TargetResource {
        key: key.clone(),
        resource_version,
        routes,
        passthrough: object,
    })
}

fn child_object<'a>(
    parent: &'a mut Map<String, Value>,
    field: &str,
) -> Result<&'a mut Map<String, Value>, StoreError> {
    parent
        .entry(field)
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| StoreError::Decode(format!("`{field}` is not an object")))
}

/// Rebuild the full object, carrying every field that was read.
pub(crate) fn encode_target(resource: &TargetResource) -> Result<Value, StoreError> {
    let mut object = match &resource.passthrough {
        Value::Object(map) => map.clone(),
        _ => {
            let mut map = Map::new();
            map.insert("apiVersion".to_string(), json!(VIRTUAL_SERVICE_API));
            map.insert("kind".to_string(), json!("VirtualService"));
            map.insert(
                "metadata".to_string(),
                json!({
                    "name": resource.key.name(),
                    "namespace": resource.key.namespace(),
                }),
            );
            map
        }
    };

    let metadata = child_object(&mut object, "metadata")?;
    match &resource.resource_version {
        Some(version) => {
            metadata.insert("resourceVersion".to_string(), json!(version));
        }
        None => {
            metadata.remove("resourceVersion");
        }
    }

    let routes =
        serde_json::to_value(&resource.routes).map_err(|e| StoreError::Decode(e.to_string()))?;
    child_object(&mut object, "spec")?.insert("http".to_string(), routes);

    Ok(Value::Object(object))
}

/// Client for the cluster API server.
#[derive(Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    base_url: String,
}

impl KubeClient {
    /// Build a client from cluster settings. A missing token or CA file is
    /// skipped, which suits local proxies such as `kubectl proxy`.
    pub fn new(config: &ClusterConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(path) = config.token_file.as_ref().filter(|p| p.exists()) {
            let token = fs::read_to_string(path)
                .with_context(|| format!("Failed to read token file {}", path.display()))?;
            let bearer = format!("Bearer {}", token.trim());
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&bearer).context("Invalid service account token")?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("meshroute-controller/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers);

        if let Some(path) = config.ca_file.as_ref().filter(|p| p.exists()) {
            let pem = fs::read(path)
                .with_context(|| format!("Failed to read CA file {}", path.display()))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("Invalid CA certificate in {}", path.display()))?;
            builder = builder.add_root_certificate(cert);
        }

        let http = builder.build().context("Failed to build HTTP client")?;
        info!(api_url = %config.api_url, "kubernetes client configured");
        Ok(Self::with_client(http, &config.api_url))
    }

    pub fn with_client(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn services_url(&self) -> String {
        format!("{}/api/v1/services", self.base_url)
    }

    fn virtual_service_url(&self, key: &ObjectKey) -> String {
        format!(
            "{}/apis/{}/namespaces/{}/virtualservices/{}",
            self.base_url,
            VIRTUAL_SERVICE_API,
            key.namespace(),
            key.name()
        )
    }

    /// Map a target store response to the store taxonomy.
    async fn store_response(key: &ObjectKey, response: Response) -> Result<Value, StoreError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| StoreError::Decode(e.to_string()));
        }

        match status {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(key.clone())),
            StatusCode::CONFLICT => Err(StoreError::Conflict(key.clone())),
            _ => Err(StoreError::Rejected {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn source_error(response: Response) -> SourceError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::GONE {
            SourceError::Expired(body)
        } else {
            SourceError::Unavailable(format!("status={status}: {body}"))
        }
    }
}

#[async_trait]
impl WatchSource for KubeClient {
    async fn list(&self, selector: &str) -> Result<SourceList, SourceError> {
        let response = self
            .http
            .get(self.services_url())
            .query(&[("labelSelector", selector)])
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::source_error(response).await);
        }

        let list: ServiceList = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        let items = list
            .items
            .into_iter()
            .map(SourceEntity::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SourceList {
            items,
            resource_version: list.metadata.resource_version.unwrap_or_default(),
        })
    }

    async fn watch(
        &self,
        selector: &str,
        resource_version: &str,
    ) -> Result<WatchStream, SourceError> {
        debug!(resource_version, "opening watch");
        let response = self
            .http
            .get(self.services_url())
            .query(&[
                ("labelSelector", selector),
                ("watch", "true"),
                ("resourceVersion", resource_version),
                ("allowWatchBookmarks", "true"),
            ])
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::source_error(response).await);
        }

        Ok(watch_stream(response))
    }
}

#[async_trait]
impl TargetStore for KubeClient {
    async fn get(&self, key: &ObjectKey) -> Result<TargetResource, StoreError> {
        let response = self
            .http
            .get(self.virtual_service_url(key))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let object = Self::store_response(key, response).await?;
        decode_target(key, object)
    }

    async fn update(&self, resource: &TargetResource) -> Result<TargetResource, StoreError> {
        let key = &resource.key;
        let body = encode_target(resource)?;

        let response = self
            .http
            .put(self.virtual_service_url(key))
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let object = Self::store_response(key, response).await?;
        decode_target(key, object)
    }
}
