//! Feed assembly: filter → rank → (annotate) → paginate → format.
//!
//! Everything here is pure. Callers take a snapshot from the post store and
//! hand it in; nothing in this module reads or mutates shared state.
//!
//! # Cursors
//!
//! The returned `cursor` is the URI of the last item on the page. Incoming
//! cursors are accepted by the HTTP layer but not used to resume a scan, so
//! every request starts from the newest post.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::BEAN_POST_NSID;
use crate::record::BeanPost;

/// Page size used when the caller does not ask for one.
pub const DEFAULT_FEED_LIMIT: usize = 50;

/// Hard ceiling on page size. Larger requests are clamped, not rejected.
pub const MAX_FEED_LIMIT: usize = 100;

/// Pagination parameters for a feed request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedParams {
    /// Requested page size; clamped to `1..=MAX_FEED_LIMIT`.
    pub limit: Option<i64>,
    /// Echoed cursor from a previous page. Currently ignored.
    pub cursor: Option<String>,
}

impl FeedParams {
    /// Build params with only a limit.
    pub fn with_limit(limit: i64) -> Self {
        Self {
            limit: Some(limit),
            cursor: None,
        }
    }

    /// The page size actually served.
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            None => DEFAULT_FEED_LIMIT,
            Some(limit) => limit.clamp(1, MAX_FEED_LIMIT as i64) as usize,
        }
    }
}

/// Why an item appears in a personalized timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedReason {
    /// The viewer follows the author.
    Following { by: String },
}

/// A reference to one post in a feed skeleton.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub post: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FeedReason>,
}

/// An ordered page of post references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedPage {
    pub feed: Vec<FeedItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl FeedPage {
    fn from_items(feed: Vec<FeedItem>) -> Self {
        let cursor = feed.last().map(|item| item.post.clone());
        Self { feed, cursor }
    }
}

/// Source of "does the viewer follow this author" answers.
///
/// The personalized timeline only depends on this trait, so a real social
/// graph lookup can replace [`HashRelevance`] without touching the assembler.
pub trait RelevanceSource: Send + Sync {
    /// Whether `viewer` follows `author`.
    fn follows(&self, viewer: &str, author: &str) -> bool;
}

/// Placeholder relevance: hashes the `(viewer, author)` pair.
///
/// There is no follow graph behind this. It gives a stable, deterministic
/// answer for each pair so the timeline has something to annotate, and it is
/// not an authorization or correctness boundary.
#[derive(Debug, Clone, Copy)]
pub struct HashRelevance {
    /// A pair "follows" when the first digest byte is below this value.
    threshold: u8,
}

impl HashRelevance {
    pub fn new(threshold: u8) -> Self {
        Self { threshold }
    }
}

impl Default for HashRelevance {
    /// Roughly one pair in three counts as following.
    fn default() -> Self {
        Self::new(85)
    }
}

impl RelevanceSource for HashRelevance {
    fn follows(&self, viewer: &str, author: &str) -> bool {
        let mut hasher = Sha256::new();
        hasher.update(viewer.as_bytes());
        hasher.update(b"|");
        hasher.update(author.as_bytes());
        hasher.finalize()[0] < self.threshold
    }
}

/// Assemble the public feed skeleton from a store snapshot.
pub fn assemble_feed(snapshot: &[BeanPost], params: &FeedParams) -> FeedPage {
    let items = rank(snapshot)
        .into_iter()
        .take(params.effective_limit())
        .map(|post| FeedItem {
            post: post.uri.clone(),
            reason: None,
        })
        .collect();

    FeedPage::from_items(items)
}

/// Assemble a personalized timeline for `viewer`.
///
/// Same pipeline as [`assemble_feed`] with a relevance annotation between
/// ranking and pagination. The viewer's own posts are never annotated.
pub fn assemble_timeline(
    snapshot: &[BeanPost],
    params: &FeedParams,
    viewer: &str,
    relevance: &dyn RelevanceSource,
) -> FeedPage {
    let items = rank(snapshot)
        .into_iter()
        .map(|post| annotate(post, viewer, relevance))
        .take(params.effective_limit())
        .collect();

    FeedPage::from_items(items)
}

fn annotate(post: &BeanPost, viewer: &str, relevance: &dyn RelevanceSource) -> FeedItem {
    let reason = post
        .author_did()
        .filter(|author| *author != viewer)
        .filter(|author| relevance.follows(viewer, author))
        .map(|author| FeedReason::Following {
            by: author.to_string(),
        });

    FeedItem {
        post: post.uri.clone(),
        reason,
    }
}

/// Filter to coffee posts and order newest first.
///
/// The sort is stable, so equal timestamps keep snapshot (insertion) order.
/// Unparsable timestamps compare as `None` and end up after every dated post.
fn rank(snapshot: &[BeanPost]) -> Vec<&BeanPost> {
    let mut ranked: Vec<(Option<DateTime<Utc>>, &BeanPost)> = snapshot
        .iter()
        .filter(|post| post.record_type == BEAN_POST_NSID)
        .map(|post| (post.created_at_time(), post))
        .collect();

    ranked.sort_by(|a, b| b.0.cmp(&a.0));
    ranked.into_iter().map(|(_, post)| post).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(author: &str, rkey: &str, created_at: &str) -> BeanPost {
        BeanPost {
            record_type: BEAN_POST_NSID.to_string(),
            uri: format!("at://{author}/app.beanfeed.post/{rkey}"),
            cid: format!("cid-{rkey}"),
            created_at: created_at.to_string(),
            text: format!("post {rkey}"),
            bean_name: None,
            origin: None,
            roast_level: None,
            brew_method: None,
            rating: None,
            location: None,
            indexed_at: None,
        }
    }

    /// Relevance that answers from a fixed list of followed authors.
    struct FixedFollows(Vec<&'static str>);

    impl RelevanceSource for FixedFollows {
        fn follows(&self, _viewer: &str, author: &str) -> bool {
            self.0.contains(&author)
        }
    }

    #[test]
    fn test_two_newest_in_descending_order() {
        let snapshot = vec![
            post("did:plc:a", "t0", "2026-10-18T10:00:00Z"),
            post("did:plc:a", "t1", "2026-10-18T10:00:01Z"),
            post("did:plc:a", "t2", "2026-10-18T10:00:02Z"),
        ];

        let page = assemble_feed(&snapshot, &FeedParams::with_limit(2));

        let uris: Vec<&str> = page.feed.iter().map(|item| item.post.as_str()).collect();
        assert_eq!(
            uris,
            vec![
                "at://did:plc:a/app.beanfeed.post/t2",
                "at://did:plc:a/app.beanfeed.post/t1",
            ]
        );
        assert_eq!(
            page.cursor.as_deref(),
            Some("at://did:plc:a/app.beanfeed.post/t1")
        );
    }

    #[test]
    fn test_empty_snapshot_has_no_cursor() {
        let page = assemble_feed(&[], &FeedParams::default());
        assert!(page.feed.is_empty());
        assert!(page.cursor.is_none());

        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json, serde_json::json!({"feed": []}));
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let snapshot = vec![
            post("did:plc:a", "first", "2026-10-18T10:00:00Z"),
            post("did:plc:a", "second", "2026-10-18T10:00:00Z"),
            post("did:plc:a", "third", "2026-10-18T10:00:00Z"),
        ];

        let page = assemble_feed(&snapshot, &FeedParams::default());
        let rkeys: Vec<&str> = page
            .feed
            .iter()
            .map(|item| item.post.rsplit('/').next().unwrap())
            .collect();
        assert_eq!(rkeys, vec!["first", "second", "third"]);

        // Repeated calls on the same snapshot are identical
        assert_eq!(page, assemble_feed(&snapshot, &FeedParams::default()));
    }

    #[test]
    fn test_unparsable_timestamps_rank_last() {
        let snapshot = vec![
            post("did:plc:a", "bogus", "not a date"),
            post("did:plc:a", "old", "2020-01-01T00:00:00Z"),
            post("did:plc:a", "new", "2026-10-18T10:00:00Z"),
        ];

        let page = assemble_feed(&snapshot, &FeedParams::default());
        let rkeys: Vec<&str> = page
            .feed
            .iter()
            .map(|item| item.post.rsplit('/').next().unwrap())
            .collect();
        assert_eq!(rkeys, vec!["new", "old", "bogus"]);
    }

    #[test]
    fn test_foreign_record_types_filtered() {
        let mut stray = post("did:plc:a", "stray", "2026-10-18T12:00:00Z");
        stray.record_type = "app.bsky.feed.post".to_string();
        let snapshot = vec![stray, post("did:plc:a", "kept", "2026-10-18T10:00:00Z")];

        let page = assemble_feed(&snapshot, &FeedParams::default());
        assert_eq!(page.feed.len(), 1);
        assert!(page.feed[0].post.ends_with("/kept"));
    }

    #[test]
    fn test_limit_defaults_and_clamping() {
        assert_eq!(FeedParams::default().effective_limit(), 50);
        assert_eq!(FeedParams::with_limit(10).effective_limit(), 10);
        assert_eq!(FeedParams::with_limit(100).effective_limit(), 100);
        assert_eq!(FeedParams::with_limit(1000).effective_limit(), 100);
        assert_eq!(FeedParams::with_limit(0).effective_limit(), 1);
        assert_eq!(FeedParams::with_limit(-5).effective_limit(), 1);

        let snapshot: Vec<BeanPost> = (0..150)
            .map(|i| post("did:plc:a", &format!("r{i}"), "2026-10-18T10:00:00Z"))
            .collect();
        let page = assemble_feed(&snapshot, &FeedParams::with_limit(500));
        assert_eq!(page.feed.len(), MAX_FEED_LIMIT);
    }

    #[test]
    fn test_timeline_annotates_followed_authors() {
        let snapshot = vec![
            post("did:plc:friend", "1", "2026-10-18T10:00:00Z"),
            post("did:plc:stranger", "2", "2026-10-18T10:00:01Z"),
            post("did:plc:me", "3", "2026-10-18T10:00:02Z"),
        ];
        let relevance = FixedFollows(vec!["did:plc:friend", "did:plc:me"]);

        let page = assemble_timeline(
            &snapshot,
            &FeedParams::default(),
            "did:plc:me",
            &relevance,
        );

        assert_eq!(page.feed.len(), 3);
        // Own post: never annotated, even though the source says "follows"
        assert!(page.feed[0].post.starts_with("at://did:plc:me/"));
        assert!(page.feed[0].reason.is_none());
        assert!(page.feed[1].reason.is_none());
        assert_eq!(
            page.feed[2].reason,
            Some(FeedReason::Following {
                by: "did:plc:friend".to_string()
            })
        );

        let json = serde_json::to_value(&page.feed[2]).unwrap();
        assert_eq!(json["reason"]["type"], "following");
        assert_eq!(json["reason"]["by"], "did:plc:friend");
    }

    #[test]
    fn test_hash_relevance_is_deterministic() {
        let relevance = HashRelevance::default();
        for i in 0..20 {
            let author = format!("did:plc:author{i}");
            assert_eq!(
                relevance.follows("did:plc:viewer", &author),
                relevance.follows("did:plc:viewer", &author)
            );
        }

        assert!(!HashRelevance::new(0).follows("did:plc:a", "did:plc:b"));
        assert!(HashRelevance::new(u8::MAX).follows("did:plc:a", "did:plc:b") || {
            // Only a leading 0xff byte escapes a threshold of 255
            let digest = Sha256::digest(b"did:plc:a|did:plc:b");
            digest[0] == u8::MAX
        });
    }
}
