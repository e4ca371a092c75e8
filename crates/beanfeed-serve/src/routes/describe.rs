//! Static feed generator metadata.

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use serde_json::{Value, json};

use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedDescription {
    uri: String,
    display_name: String,
    description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DescribeResponse {
    did: String,
    feeds: Vec<FeedDescription>,
}

/// `GET /xrpc/app.bsky.feed.describeFeedGenerator`
pub async fn describe_feed_generator(State(state): State<AppState>) -> Json<DescribeResponse> {
    let config = &state.config;
    Json(DescribeResponse {
        did: config.service_did.clone(),
        feeds: vec![FeedDescription {
            uri: config.feed_uri(),
            display_name: "Beanfeed".to_string(),
            description: format!(
                "Coffee posts from the last {} hours, newest first.",
                config.retention.num_hours()
            ),
        }],
    })
}

/// `GET /.well-known/did.json`
///
/// Only meaningful when the service DID is the `did:web` of this host.
pub async fn did_document(State(state): State<AppState>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "@context": ["https://www.w3.org/ns/did/v1"],
        "id": config.service_did,
        "service": [{
            "id": "#bsky_fg",
            "type": "BskyFeedGenerator",
            "serviceEndpoint": format!("https://{}", config.hostname),
        }],
    }))
}
