//! `hydra worker` command: run the worker runtime with the metrics
//! endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hydra_core::metrics;
use hydra_core::provider::SandboxProvider;
use hydra_core::provider::mock::MockProvider;
use hydra_core::worker::{Worker, WorkerConfig, task_queue_from_env};
use hydra_core::workflow::OrchestratorSettings;

use crate::config;

/// Environment variable for the metrics port.
const METRICS_PORT_ENV: &str = "METRICS_PORT";

/// Environment variable disabling the metrics endpoint entirely.
const DISABLE_METRICS_ENV: &str = "DISABLE_METRICS";

/// Run the worker until interrupted.
pub async fn run_worker(pool: SqlitePool) -> Result<()> {
    let provider = build_provider(&config::resolve_provider_kind())?;
    let config = WorkerConfig {
        task_queue: task_queue_from_env(),
        ..WorkerConfig::default()
    };

    info!(task_queue = %config.task_queue, "starting worker");

    let cancel = CancellationToken::new();

    // Metrics endpoint, unless disabled.
    if std::env::var(DISABLE_METRICS_ENV).is_err() {
        let port: u16 = std::env::var(METRICS_PORT_ENV)
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(9090);
        spawn_metrics_server(port, cancel.clone()).await?;
    }

    // Ctrl-C requests a graceful drain.
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, draining");
            shutdown.cancel();
        }
    });

    let worker = Worker::new(pool, provider, config, OrchestratorSettings::new());
    worker.run(cancel).await
}

/// Build the named sandbox provider.
///
/// Only the in-memory mock ships in-tree; real provider SDKs implement
/// [`SandboxProvider`] and are wired in here.
fn build_provider(kind: &str) -> Result<Arc<dyn SandboxProvider>> {
    match kind {
        "mock" => {
            warn!("using the in-memory mock sandbox provider");
            Ok(Arc::new(MockProvider::new()))
        }
        other => anyhow::bail!(
            "unknown sandbox provider {other:?} (set {}=mock or a [provider] config section)",
            config::PROVIDER_ENV
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_provider_builds() {
        assert!(build_provider("mock").is_ok());
    }

    #[test]
    fn unknown_provider_is_an_error() {
        let err = build_provider("e2b").err().unwrap();
        assert!(err.to_string().contains("unknown sandbox provider"));
    }
}

/// Serve `/metrics` in the Prometheus text format.
async fn spawn_metrics_server(port: u16, cancel: CancellationToken) -> Result<()> {
    let app = Router::new().route("/metrics", get(|| async { metrics::encode() }));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics endpoint on {addr}"))?;

    info!(%addr, "metrics available at /metrics");

    tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            cancel.cancelled().await;
        });
        if let Err(e) = serve.await {
            warn!(error = %e, "metrics server exited");
        }
    });

    Ok(())
}
