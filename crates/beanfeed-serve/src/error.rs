//! API error types and response formatting.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::auth::AuthError;

/// API error type that converts to appropriate HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or unacceptable bearer token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Valid token without the required scope.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The requested feed is not served here.
    #[error("unknown feed: {0}")]
    UnknownFeed(String),

    /// Invalid request parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        if err.status() == StatusCode::FORBIDDEN {
            Self::Forbidden(err.to_string())
        } else {
            Self::Unauthorized(err.to_string())
        }
    }
}

/// JSON error response body.
#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            Self::Unauthorized(reason) => {
                (StatusCode::UNAUTHORIZED, "unauthorized", Some(reason.clone()))
            }
            Self::Forbidden(reason) => (StatusCode::FORBIDDEN, "forbidden", Some(reason.clone())),
            Self::UnknownFeed(uri) => (
                StatusCode::BAD_REQUEST,
                "UnknownFeed",
                Some(format!("unknown feed: {uri}")),
            ),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg.clone())),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg.clone())),
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    Some("An internal error occurred".to_string()),
                )
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}
