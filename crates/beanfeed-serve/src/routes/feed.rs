//! Feed skeleton and personalized timeline endpoints.

use axum::Json;
use axum::extract::{Extension, Query, State};
use beanfeed_core::{FeedPage, FeedParams, assemble_feed, assemble_timeline};
use serde::Deserialize;

use crate::auth::AuthenticatedIdentity;
use crate::error::ApiError;
use crate::state::AppState;

/// Query parameters shared by both feed endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    /// Feed URI being requested (skeleton only).
    pub feed: Option<String>,
    pub limit: Option<String>,
    /// Accepted for compatibility; pages always start at the newest post.
    pub cursor: Option<String>,
}

impl FeedQuery {
    fn params(self) -> Result<FeedParams, ApiError> {
        let limit = match self.limit.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse::<i64>()
                    .map_err(|_| ApiError::BadRequest(format!("invalid limit: {raw}")))?,
            ),
        };

        Ok(FeedParams {
            limit,
            cursor: self.cursor,
        })
    }
}

/// `GET /xrpc/app.bsky.feed.getFeedSkeleton`
pub async fn get_feed_skeleton(
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<FeedPage>, ApiError> {
    if let Some(feed) = query.feed.as_deref()
        && feed != state.config.feed_uri()
    {
        return Err(ApiError::UnknownFeed(feed.to_string()));
    }

    let params = query.params()?;
    let snapshot = state.store.snapshot();
    let page = assemble_feed(&snapshot, &params);

    tracing::debug!(
        limit = params.effective_limit(),
        returned = page.feed.len(),
        "served feed skeleton"
    );
    metrics::counter!("feed_requests_total", "feed" => "skeleton").increment(1);

    Ok(Json(page))
}

/// `GET /xrpc/app.bsky.feed.getTimeline` (authenticated)
pub async fn get_timeline(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthenticatedIdentity>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<FeedPage>, ApiError> {
    let params = query.params()?;
    let snapshot = state.store.snapshot();
    let page = assemble_timeline(&snapshot, &params, &identity.subject, state.relevance.as_ref());

    tracing::debug!(
        viewer = %identity.subject,
        returned = page.feed.len(),
        "served timeline"
    );
    metrics::counter!("feed_requests_total", "feed" => "timeline").increment(1);

    Ok(Json(page))
}
