//! Observability for meshcache.
//!
//! Provides logging initialization and an optional Prometheus metrics
//! endpoint.

use crate::config::ObservabilityConfig;
use crate::error::{MeshError, Result};
use metrics::{counter, describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging. Safe to call once per process; later calls are
/// no-ops (integration tests share one process).
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = if config.json_logs {
        subscriber.with(fmt::layer().json()).try_init()
    } else {
        subscriber.with(fmt::layer()).try_init()
    };

    if result.is_ok() {
        describe_metrics();
        info!("observability initialized");
    }
    Ok(())
}

/// Run the Prometheus metrics endpoint.
pub async fn run_metrics_server(config: ObservabilityConfig) -> Result<()> {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .map_err(|e| MeshError::Internal(format!("failed to install metrics recorder: {}", e)))?;

    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "metrics server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| MeshError::Network(e.to_string()))?;

    Ok(())
}

fn describe_metrics() {
    describe_counter!(
        "meshcache_writes_total",
        "Replicated write operations accepted by the coordinator"
    );
    describe_counter!(
        "meshcache_reads_total",
        "Read operations served by the coordinator"
    );
    describe_counter!(
        "meshcache_read_fallbacks_total",
        "Reads that fell past the primary replica"
    );
    describe_counter!(
        "meshcache_backfills_total",
        "Backfill writes issued during read repair"
    );
    describe_counter!(
        "meshcache_backfill_failures_total",
        "Backfill writes that did not complete"
    );
    describe_gauge!(
        "meshcache_peers_live",
        "Peers currently considered live by the membership tracker"
    );
}

/// Count one coordinator-level operation outcome.
pub(crate) fn record_op(name: &'static str) {
    counter!(name).increment(1);
}
