//! Prometheus metrics helpers for the firehose ingester.
//!
//! # Usage
//!
//! ```rust,ignore
//! use firehose_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     metrics::counter!("stream_events_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`stream_`, `batch_`, `bus_`, `ingest_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: used sparingly (`reason`, `trigger`)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server on `0.0.0.0:<port>/metrics`.
///
/// The listener is bound before returning so port conflicts surface to the
/// caller; serving happens on a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<SocketAddr, std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("Metrics server listening on http://{}/metrics", local_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(local_addr)
}

/// Register descriptions for the metrics emitted by the ingester.
fn register_common_metrics() {
    // =========================================================================
    // Upstream stream
    // =========================================================================

    describe_counter!("stream_lines_total", "Raw lines read from the upstream feed");
    describe_counter!(
        "stream_lines_skipped_total",
        "Lines discarded by the decoder (label: reason)"
    );
    describe_counter!("stream_events_total", "Events decoded from the feed");
    describe_counter!(
        "stream_connect_attempts_total",
        "Connection attempts made by the supervisor"
    );
    describe_counter!(
        "stream_connect_failures_total",
        "Connection attempts that failed"
    );
    describe_counter!(
        "stream_restarts_total",
        "Full connect cycles restarted by the outer loop"
    );
    describe_gauge!(
        "stream_connection_state",
        "Connection state (0=disconnected, 1=connecting, 2=streaming, 3=backoff)"
    );

    // =========================================================================
    // Batches
    // =========================================================================

    describe_counter!("batch_flushes_total", "Batch flushes (label: trigger)");
    describe_counter!(
        "batch_events_written_total",
        "Events written to batch files"
    );
    describe_counter!("batch_write_errors_total", "Failed batch writes");
    describe_counter!(
        "batch_events_dropped_total",
        "Events dropped because their batch failed to write"
    );
    describe_gauge!("batch_pending_events", "Events waiting in the accumulator");

    // =========================================================================
    // Message bus
    // =========================================================================

    describe_counter!("bus_forwarded_total", "Records published to the message bus");
    describe_counter!("bus_publish_errors_total", "Failed message bus publishes");
    describe_counter!(
        "bus_dropped_total",
        "Records dropped because the forwarder buffer stayed full"
    );

    describe_gauge!(
        "ingest_running",
        "Whether the ingester is running (1=yes, 0=no)"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}
