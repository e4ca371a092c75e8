//! Prometheus metrics helpers for Beanfeed.
//!
//! # Usage
//!
//! ```rust,ignore
//! use beanfeed_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     metrics::counter!("firehose_frames_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`firehose_`, `store_`, `feed_`, `auth_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: low-cardinality reasons only, never URIs or DIDs

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
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

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server on `port`, serving `/metrics`.
///
/// Binds before returning so a taken port is reported to the caller; serving
/// happens on a background task.
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
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

/// Register descriptions for the metrics emitted across Beanfeed.
fn register_common_metrics() {
    // =========================================================================
    // Firehose
    // =========================================================================

    describe_counter!("firehose_frames_total", "Frames received from the firehose");
    describe_counter!(
        "firehose_frames_dropped_total",
        "Frames dropped before record extraction (label: reason)"
    );
    describe_counter!(
        "firehose_records_accepted_total",
        "Coffee posts accepted into the store"
    );
    describe_counter!(
        "firehose_records_duplicate_total",
        "Coffee posts skipped because their URI was already stored"
    );
    describe_counter!(
        "firehose_records_rejected_total",
        "Coffee posts rejected by validation (label: reason)"
    );
    describe_counter!(
        "firehose_store_errors_total",
        "Store writes that failed during ingestion"
    );
    describe_counter!(
        "firehose_reconnects_total",
        "Reconnect attempts after a lost or failed connection"
    );
    describe_gauge!(
        "firehose_connected",
        "Whether the firehose connection is open (1=yes, 0=no)"
    );

    // =========================================================================
    // Store
    // =========================================================================

    describe_gauge!("store_posts", "Posts currently held in the store");
    describe_counter!("store_evicted_total", "Posts removed by the retention sweep");

    // =========================================================================
    // Feeds
    // =========================================================================

    describe_counter!("feed_requests_total", "Feed pages served (label: feed)");
    describe_counter!(
        "auth_failures_total",
        "Rejected bearer tokens (label: reason)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        let _ = try_init_metrics();
        register_common_metrics();
        register_common_metrics();
    }
}
