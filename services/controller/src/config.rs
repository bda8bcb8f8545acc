//! Controller configuration.
//!
//! Everything is env-driven; defaults match an in-cluster deployment using
//! the pod's service account.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use meshroute_reconcile::{BackoffPolicy, DEFAULT_BUCKET_BURST, DEFAULT_BUCKET_QPS};

use crate::controller::ControllerConfig;
use crate::routes::{
    RouteSettings, DEFAULT_CLUSTER_DOMAIN, DEFAULT_PORT_ANNOTATION, DEFAULT_ROUTE_LABEL,
};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// How to reach the API server.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    /// API server base URL.
    pub api_url: String,

    /// Bearer token file; skipped if it does not exist.
    pub token_file: Option<PathBuf>,

    /// Extra root CA (PEM); skipped if it does not exist.
    pub ca_file: Option<PathBuf>,
}

/// Controller configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub routes: RouteSettings,
    pub controller: ControllerConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_url = var("MESHROUTE_API_URL").unwrap_or_else(|| {
            match (
                var("KUBERNETES_SERVICE_HOST"),
                var("KUBERNETES_SERVICE_PORT"),
            ) {
                (Some(host), Some(port)) => format!("https://{host}:{port}"),
                _ => "https://kubernetes.default.svc".to_string(),
            }
        });

        let token_file = var("MESHROUTE_TOKEN_FILE")
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from(SERVICE_ACCOUNT_DIR).join("token")));
        let ca_file = var("MESHROUTE_CA_FILE")
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from(SERVICE_ACCOUNT_DIR).join("ca.crt")));

        let routes = RouteSettings {
            route_label: var("MESHROUTE_ROUTE_LABEL")
                .unwrap_or_else(|| DEFAULT_ROUTE_LABEL.to_string()),
            port_annotation: var("MESHROUTE_PORT_ANNOTATION")
                .unwrap_or_else(|| DEFAULT_PORT_ANNOTATION.to_string()),
            cluster_domain: var("MESHROUTE_CLUSTER_DOMAIN")
                .unwrap_or_else(|| DEFAULT_CLUSTER_DOMAIN.to_string()),
        };

        let workers: usize = parse(&var, "MESHROUTE_WORKERS", "an integer")?
            .unwrap_or(2)
            .clamp(1, 64);

        let backoff_base_ms: u64 =
            parse(&var, "MESHROUTE_BACKOFF_BASE_MS", "an integer (milliseconds)")?.unwrap_or(5);
        let backoff_max_secs: u64 =
            parse(&var, "MESHROUTE_BACKOFF_MAX_SECS", "an integer (seconds)")?.unwrap_or(1000);
        let item_backoff = BackoffPolicy::exact(
            Duration::from_millis(backoff_base_ms.max(1)),
            Duration::from_secs(backoff_max_secs.max(1)),
        );

        let queue_qps: f64 =
            parse(&var, "MESHROUTE_QUEUE_QPS", "a number")?.unwrap_or(DEFAULT_BUCKET_QPS);
        let queue_burst: u32 =
            parse(&var, "MESHROUTE_QUEUE_BURST", "an integer")?.unwrap_or(DEFAULT_BUCKET_BURST);

        let resync_secs: u64 =
            parse(&var, "MESHROUTE_RESYNC_INTERVAL_SECS", "an integer (seconds)")?.unwrap_or(0);
        let resync_interval = (resync_secs > 0).then(|| Duration::from_secs(resync_secs));

        let log_level = var("MESHROUTE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            cluster: ClusterConfig {
                api_url,
                token_file,
                ca_file,
            },
            routes,
            controller: ControllerConfig {
                workers,
                item_backoff,
                queue_qps,
                queue_burst,
                resync_interval,
                ..Default::default()
            },
            log_level,
        })
    }
}

fn parse<T>(var: impl Fn(&str) -> Option<String>, name: &str, expected: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be {expected}."))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.cluster.api_url, "https://kubernetes.default.svc");
        assert_eq!(
            config.cluster.token_file,
            Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/token"
            ))
        );
        assert_eq!(config.routes, RouteSettings::default());
        assert_eq!(config.controller, ControllerConfig::default());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_in_cluster_api_url() {
        let config = load(&[
            ("KUBERNETES_SERVICE_HOST", "10.0.0.1"),
            ("KUBERNETES_SERVICE_PORT", "443"),
        ])
        .unwrap();
        assert_eq!(config.cluster.api_url, "https://10.0.0.1:443");

        let config = load(&[
            ("KUBERNETES_SERVICE_HOST", "10.0.0.1"),
            ("MESHROUTE_API_URL", "http://127.0.0.1:8001"),
        ])
        .unwrap();
        assert_eq!(config.cluster.api_url, "http://127.0.0.1:8001");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("MESHROUTE_ROUTE_LABEL", "routing"),
            ("MESHROUTE_CLUSTER_DOMAIN", "corp.internal"),
            ("MESHROUTE_WORKERS", "500"),
            ("MESHROUTE_BACKOFF_BASE_MS", "50"),
            ("MESHROUTE_BACKOFF_MAX_SECS", "60"),
            ("MESHROUTE_QUEUE_QPS", "2.5"),
            ("MESHROUTE_RESYNC_INTERVAL_SECS", "300"),
            ("MESHROUTE_LOG_LEVEL", "debug"),
        ])
        .unwrap();

        assert_eq!(config.routes.route_label, "routing");
        assert_eq!(config.routes.cluster_domain, "corp.internal");
        assert_eq!(config.controller.workers, 64);
        assert_eq!(
            config.controller.item_backoff,
            BackoffPolicy::exact(Duration::from_millis(50), Duration::from_secs(60))
        );
        assert_eq!(config.controller.queue_qps, 2.5);
        assert_eq!(
            config.controller.resync_interval,
            Some(Duration::from_secs(300))
        );
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_invalid_numbers_are_errors() {
        let err = load(&[("MESHROUTE_WORKERS", "many")]).unwrap_err();
        assert!(err.to_string().contains("MESHROUTE_WORKERS"));

        assert!(load(&[("MESHROUTE_QUEUE_BURST", "-1")]).is_err());
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = load(&[("MESHROUTE_ROUTE_LABEL", "  "), ("MESHROUTE_WORKERS", "")]).unwrap();
        assert_eq!(config.routes.route_label, DEFAULT_ROUTE_LABEL);
        assert_eq!(config.controller.workers, 2);
    }
}
