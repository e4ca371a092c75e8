//! Firehose client: frame codec, reconnect policy and the ingestor loop.

pub mod backoff;
pub mod codec;
pub mod ingestor;

pub use backoff::{ReconnectBackoff, ReconnectPolicy};
pub use codec::{CarCommitDecoder, CommitDecoder, CommitEvent, Frame, RepoOp};
pub use ingestor::{
    CommitSummary, DEFAULT_FIREHOSE_URL, FirehoseConfig, FirehoseIngestor, FrameOutcome,
    IngestorState, IngestorStats,
};
