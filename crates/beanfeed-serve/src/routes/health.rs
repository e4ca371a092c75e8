//! Health check endpoint.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    /// Posts currently in the store.
    posts: usize,
    /// Firehose connection state.
    firehose: &'static str,
}

/// Public health check endpoint.
///
/// Reports the store size and whether the firehose is connected. Always 200:
/// a disconnected firehose is reconnecting, not down.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        posts: state.store.count(),
        firehose: state.firehose.borrow().as_str(),
    })
}
