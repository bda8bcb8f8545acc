//! meshroute controller
//!
//! Keeps Istio virtual service route tables in line with labelled
//! Kubernetes services.
//!
//! ## Architecture
//!
//! - **Informer**: lists and watches labelled services into a local cache
//! - **Event handler**: records tombstones and enqueues changed keys
//! - **Workers**: reconcile one key at a time against the virtual service
//! - **Work queue**: deduplicates keys and backs off failing ones

use std::sync::Arc;

use anyhow::Result;
use meshroute_controller::{Config, Controller, ControllerContext, KubeClient};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to MESHROUTE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting meshroute controller");
    info!(
        api_url = %config.cluster.api_url,
        route_label = %config.routes.route_label,
        cluster_domain = %config.routes.cluster_domain,
        workers = config.controller.workers,
        "Configuration loaded"
    );

    let client = Arc::new(KubeClient::new(&config.cluster)?);
    let context = ControllerContext {
        source: client.clone(),
        store: client,
        settings: config.routes.clone(),
    };
    let controller = Controller::new(context, config.controller.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut controller_handle = tokio::spawn(controller.run(shutdown_rx));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for in-flight reconciliations to finish...");
    if let Err(e) = controller_handle.await {
        error!(error = %e, "Controller task panicked");
    }

    info!("Controller shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
