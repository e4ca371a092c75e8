//! Error types for ingestion and storage.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion or store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error outside of persistence (e.g., reading the store at startup).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store's in-memory state changed but could not be written to disk.
    #[error("failed to persist store to {}: {source}", path.display())]
    Persist {
        /// Destination file.
        path: PathBuf,
        /// Underlying write or rename failure.
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization error for the persisted store.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connecting to the firehose took too long.
    #[error("connection timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// Firehose frame or block decoding error.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Failures while decoding firehose frames and commit blocks.
///
/// These are routine on a public network stream; the ingestor drops the frame
/// and moves on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Bytes were not valid CBOR.
    #[error("CBOR error: {0}")]
    Cbor(String),

    /// Frame header was missing or had the wrong shape.
    #[error("invalid frame header: {0}")]
    Header(String),

    /// Commit body was missing required fields.
    #[error("invalid commit body: {0}")]
    Body(String),

    /// CAR block archive was truncated or malformed.
    #[error("CAR error: {0}")]
    Car(String),

    /// Requested block is not part of the commit.
    #[error("block {0} not found in commit")]
    MissingBlock(String),

    /// Content identifier could not be parsed.
    #[error("invalid CID: {0}")]
    Cid(String),
}
