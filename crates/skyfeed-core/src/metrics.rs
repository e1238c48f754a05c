//! Prometheus metrics helpers for skyfeed.
//!
//! # Usage
//!
//! ```rust,ignore
//! use skyfeed_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     metrics::counter!("ingest_messages_total", "source" => "firehose").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`ingest_`, `feed_`, `manual_`)
//! - Suffix: unit or type (`_total` for counters)
//! - Labels: `source` names the stream adapter; keep cardinality low

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

/// Start the Prometheus metrics HTTP server.
///
/// Binds `0.0.0.0:port`, then serves `/metrics` from a background task.
/// Bind failures are returned; serve failures are logged.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}

fn register_common_metrics() {
    // =========================================================================
    // Stream ingestion (label: source)
    // =========================================================================

    describe_counter!(
        "ingest_messages_total",
        "Messages decoded from the upstream stream"
    );
    describe_counter!(
        "ingest_messages_invalid_total",
        "Messages dropped because they failed to decode"
    );
    describe_counter!(
        "ingest_checkpoint_writes_total",
        "Cursor checkpoints persisted"
    );
    describe_counter!(
        "ingest_checkpoint_errors_total",
        "Cursor checkpoint writes that failed"
    );
    describe_counter!(
        "ingest_reconnects_total",
        "Reconnect attempts after a session failed"
    );
    describe_counter!(
        "ingest_handler_errors_total",
        "Batches the event handler failed to apply"
    );
    describe_gauge!("ingest_cursor", "Last cursor persisted for the subscription");
    describe_gauge!(
        "ingest_running",
        "Whether the ingestion loop is running (1=yes, 0=no)"
    );

    // =========================================================================
    // Feed index
    // =========================================================================

    describe_counter!("feed_posts_indexed_total", "Posts added to the feed index");
    describe_counter!(
        "feed_posts_deleted_total",
        "Posts removed from the feed index"
    );

    // =========================================================================
    // Manual overrides (label: action)
    // =========================================================================

    describe_counter!(
        "manual_override_uris_total",
        "Post URLs applied from the override files"
    );
}

/// Increment a counter labelled with the stream source.
#[inline]
pub fn increment_source(name: &'static str, source: &'static str, count: u64) {
    metrics::counter!(name, "source" => source).increment(count);
}

/// Set a gauge labelled with the stream source.
#[inline]
pub fn set_source_gauge(name: &'static str, source: &'static str, value: f64) {
    metrics::gauge!(name, "source" => source).set(value);
}
