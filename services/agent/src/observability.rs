//! Tracing and metrics wiring shared by the agent, backend and demo binaries.
//!
//! Logging goes through a `tracing-subscriber` fmt layer filtered by `RUST_LOG`, falling
//! back to `info` (or `debug` when the link config asks for per-message lines). Metrics
//! are recorded through the `metrics` facade into a Prometheus recorder, optionally
//! served over HTTP with `/metrics`, `/live` and `/ready`.
use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static LOG_INIT: OnceLock<()> = OnceLock::new();

/// Install the global subscriber and metrics recorder. Safe to call more than once; only
/// the first call takes effect.
pub fn init_observability(service_name: &str, debug: bool) -> Result<PrometheusHandle> {
    LOG_INIT.get_or_init(|| {
        let fallback = if debug { "debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
    let handle = install_metrics_recorder()?;
    tracing::debug!(service = service_name, "observability initialized");
    Ok(handle)
}

fn install_metrics_recorder() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install metrics recorder")?;
    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn metrics_router(handle: PrometheusHandle) -> axum::Router {
    axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route("/ready", axum::routing::get(|| async { "ok" }))
}

/// Serve Prometheus metrics and health probes until the task is dropped.
pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "metrics listener started");
    axum::serve(listener, metrics_router(handle).into_make_service()).await
}
