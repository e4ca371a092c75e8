//! Firehose ingestion and post storage for Beanfeed.
//!
//! # Modules
//!
//! - [`firehose`] - Frame codec, reconnect policy and the [`FirehoseIngestor`]
//! - [`store`] - The [`PostStore`] and its retention sweep
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Firehose     │  com.atproto.sync.subscribeRepos (WebSocket)
//! └────────┬────────┘
//!          │  binary frames
//!          ▼
//! ┌─────────────────┐
//! │ CommitDecoder   │  DAG-CBOR header/body, CAR record blocks
//! └────────┬────────┘
//!          │  serde_json::Value
//!          ▼
//! ┌─────────────────┐
//! │ validate_record │  NotApplicable / Malformed / Accepted
//! └────────┬────────┘
//!          │  BeanPost
//!          ▼
//! ┌─────────────────┐
//! │    PostStore    │  dedupe by URI, JSON file, 18h retention
//! └─────────────────┘
//! ```

pub mod error;
pub mod firehose;
pub mod store;

pub use error::{DecodeError, Error, Result};

pub use firehose::{
    CarCommitDecoder, CommitDecoder, FirehoseConfig, FirehoseIngestor, FrameOutcome,
    IngestorState, IngestorStats, ReconnectPolicy,
};

pub use store::{PostStore, run_eviction_loop};
