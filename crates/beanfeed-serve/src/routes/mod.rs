//! API route definitions.

mod describe;
mod feed;
mod health;

use axum::Router;
use axum::http::Uri;
use axum::middleware;
use axum::routing::get;

use crate::auth::require_auth;
use crate::error::ApiError;
use crate::state::AppState;

/// Build the complete API router.
///
/// # Route Structure
///
/// ## Public (no auth)
/// - `GET /health` - Health check with store size and firehose state
/// - `GET /.well-known/did.json` - `did:web` document for the service
/// - `GET /xrpc/app.bsky.feed.describeFeedGenerator` - Feeds offered
/// - `GET /xrpc/app.bsky.feed.getFeedSkeleton` - Newest coffee posts
///
/// ## Protected (bearer token required)
/// - `GET /xrpc/app.bsky.feed.getTimeline` - Coffee posts annotated for the viewer
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health::health_check))
        .route("/.well-known/did.json", get(describe::did_document))
        .route(
            "/xrpc/app.bsky.feed.describeFeedGenerator",
            get(describe::describe_feed_generator),
        )
        .route(
            "/xrpc/app.bsky.feed.getFeedSkeleton",
            get(feed::get_feed_skeleton),
        );

    let authenticated = Router::new()
        .route("/xrpc/app.bsky.feed.getTimeline", get(feed::get_timeline))
        .route_layer(middleware::from_fn(require_auth));

    Router::new()
        .merge(public)
        .merge(authenticated)
        .fallback(not_found)
        .with_state(state)
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(uri.path().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support::{bearer, claims};
    use crate::state::Config;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use beanfeed_core::{BEAN_POST_NSID, BeanPost, RelevanceSource};
    use beanfeed_ingest::{IngestorState, PostStore};
    use serde_json::{Value, json};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;
    use tower::ServiceExt;

    struct FollowsEveryone;

    impl RelevanceSource for FollowsEveryone {
        fn follows(&self, _viewer: &str, _author: &str) -> bool {
            true
        }
    }

    fn test_config() -> Config {
        Config {
            bind_addr: "127.0.0.1:0".to_string(),
            hostname: "feeds.example.com".to_string(),
            service_did: "did:web:feeds.example.com".to_string(),
            publisher_did: "did:plc:publisher".to_string(),
            feed_name: "coffee".to_string(),
            firehose_url: "ws://127.0.0.1:1".to_string(),
            data_path: PathBuf::from("unused.json"),
            retention: chrono::Duration::hours(18),
            eviction_interval: Duration::from_secs(600),
            reconnect_delay: Duration::from_secs(3),
            reconnect_max_delay: Duration::ZERO,
        }
    }

    fn post(author: &str, rkey: &str, created_at: &str) -> BeanPost {
        BeanPost {
            record_type: BEAN_POST_NSID.to_string(),
            uri: format!("at://{author}/{BEAN_POST_NSID}/{rkey}"),
            cid: format!("bafy{rkey}"),
            created_at: created_at.to_string(),
            text: format!("cup {rkey}"),
            bean_name: None,
            origin: None,
            roast_level: None,
            brew_method: None,
            rating: None,
            location: None,
            indexed_at: None,
        }
    }

    fn test_app() -> (Router, watch::Sender<IngestorState>) {
        let store = Arc::new(PostStore::in_memory());
        store
            .insert(post("did:plc:alice", "1", "2026-10-18T08:00:00Z"))
            .unwrap();
        store
            .insert(post("did:plc:bob", "2", "2026-10-18T09:00:00Z"))
            .unwrap();
        store
            .insert(post("did:plc:viewer", "3", "2026-10-18T10:00:00Z"))
            .unwrap();

        let (state_tx, state_rx) = watch::channel(IngestorState::Connected);
        let state = AppState::new(test_config(), store, state_rx)
            .with_relevance(Arc::new(FollowsEveryone));
        (router(state), state_tx)
    }

    async fn get(app: Router, uri: &str, auth: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::builder().uri(uri);
        if let Some(auth) = auth {
            request = request.header(header::AUTHORIZATION, auth);
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn health_reports_store_and_firehose() {
        let (app, state_tx) = test_app();

        let (status, body) = get(app.clone(), "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["posts"], 3);
        assert_eq!(body["firehose"], "connected");

        state_tx.send_replace(IngestorState::Connecting);
        let (_, body) = get(app, "/health", None).await;
        assert_eq!(body["firehose"], "connecting");
    }

    #[tokio::test]
    async fn feed_skeleton_newest_first() {
        let (app, _state_tx) = test_app();

        let (status, body) = get(app, "/xrpc/app.bsky.feed.getFeedSkeleton?limit=2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "feed": [
                    {"post": "at://did:plc:viewer/app.beanfeed.post/3"},
                    {"post": "at://did:plc:bob/app.beanfeed.post/2"},
                ],
                "cursor": "at://did:plc:bob/app.beanfeed.post/2",
            })
        );
    }

    #[tokio::test]
    async fn feed_skeleton_clamps_and_ignores_cursor() {
        let (app, _state_tx) = test_app();

        let (status, body) = get(
            app.clone(),
            "/xrpc/app.bsky.feed.getFeedSkeleton?limit=1000&cursor=at://whatever",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["feed"].as_array().unwrap().len(), 3);
        assert_eq!(body["feed"][0]["post"], "at://did:plc:viewer/app.beanfeed.post/3");

        let (status, body) = get(app, "/xrpc/app.bsky.feed.getFeedSkeleton?limit=0", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["feed"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn feed_skeleton_checks_feed_uri() {
        let (app, _state_tx) = test_app();

        let known = "/xrpc/app.bsky.feed.getFeedSkeleton?feed=at://did:plc:publisher/app.bsky.feed.generator/coffee";
        let (status, _) = get(app.clone(), known, None).await;
        assert_eq!(status, StatusCode::OK);

        let unknown = "/xrpc/app.bsky.feed.getFeedSkeleton?feed=at://did:plc:publisher/app.bsky.feed.generator/tea";
        let (status, body) = get(app.clone(), unknown, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "UnknownFeed");

        let (status, body) = get(app, "/xrpc/app.bsky.feed.getFeedSkeleton?limit=lots", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn timeline_requires_token() {
        let (app, _state_tx) = test_app();

        let (status, body) = get(app, "/xrpc/app.bsky.feed.getTimeline", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");
        assert_eq!(body["message"], "missing token");
    }

    #[tokio::test]
    async fn timeline_rejects_expired_token() {
        let (app, _state_tx) = test_app();
        let mut c = claims("did:plc:viewer");
        c["exp"] = json!(chrono::Utc::now().timestamp() - 1);

        let (status, body) = get(app, "/xrpc/app.bsky.feed.getTimeline", Some(&bearer(&c))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "expired");
    }

    #[tokio::test]
    async fn timeline_rejects_insufficient_scope() {
        let (app, _state_tx) = test_app();
        let mut c = claims("did:plc:viewer");
        c["exp"] = json!(chrono::Utc::now().timestamp() + 3600);
        c["scope"] = json!("com.example.read");

        let (status, body) = get(app, "/xrpc/app.bsky.feed.getTimeline", Some(&bearer(&c))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden");
        assert_eq!(body["message"], "insufficient scope");
    }

    #[tokio::test]
    async fn timeline_annotates_followed_authors() {
        let (app, _state_tx) = test_app();
        let mut c = claims("did:plc:viewer");
        c["exp"] = json!(chrono::Utc::now().timestamp() + 3600);

        let (status, body) = get(app, "/xrpc/app.bsky.feed.getTimeline", Some(&bearer(&c))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["feed"],
            json!([
                {"post": "at://did:plc:viewer/app.beanfeed.post/3"},
                {
                    "post": "at://did:plc:bob/app.beanfeed.post/2",
                    "reason": {"type": "following", "by": "did:plc:bob"},
                },
                {
                    "post": "at://did:plc:alice/app.beanfeed.post/1",
                    "reason": {"type": "following", "by": "did:plc:alice"},
                },
            ])
        );
        assert_eq!(body["cursor"], "at://did:plc:alice/app.beanfeed.post/1");
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let (app, _state_tx) = test_app();

        let (status, body) = get(app, "/xrpc/app.bsky.feed.getPostThread", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
        assert_eq!(body["message"], "/xrpc/app.bsky.feed.getPostThread");
    }

    #[tokio::test]
    async fn describe_and_did_document() {
        let (app, _state_tx) = test_app();

        let (status, body) = get(app.clone(), "/xrpc/app.bsky.feed.describeFeedGenerator", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["did"], "did:web:feeds.example.com");
        assert_eq!(
            body["feeds"][0]["uri"],
            "at://did:plc:publisher/app.bsky.feed.generator/coffee"
        );
        assert!(body["feeds"][0]["displayName"].is_string());

        let (status, body) = get(app, "/.well-known/did.json", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "did:web:feeds.example.com");
        assert_eq!(
            body["service"][0]["serviceEndpoint"],
            "https://feeds.example.com"
        );
    }
}
