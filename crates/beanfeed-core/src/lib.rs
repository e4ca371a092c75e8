//! Core types, validation and feed assembly for Beanfeed.
//!
//! This crate provides:
//! - The [`BeanPost`] record model and [`validate_record`] for untyped firehose blocks
//! - The feed pipeline ([`assemble_feed`], [`assemble_timeline`]) and the
//!   pluggable [`RelevanceSource`]
//! - Prometheus metrics helpers

pub mod feed;
pub mod metrics;
pub mod record;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Collection NSID and `$type` of coffee posts.
pub const BEAN_POST_NSID: &str = "app.beanfeed.post";

/// How long a post stays in the store, measured from its `createdAt`.
pub const RETENTION_HOURS: i64 = 18;

pub use feed::{
    DEFAULT_FEED_LIMIT, FeedItem, FeedPage, FeedParams, FeedReason, HashRelevance, MAX_FEED_LIMIT,
    RelevanceSource, assemble_feed, assemble_timeline,
};
pub use record::{BeanPost, Location, RecordOutcome, Rejection, author_from_uri, validate_record};
