//! Beanfeed Serve - feed generator HTTP service for coffee posts.
//!
//! This crate serves the posts collected by the firehose ingestor as an AT
//! Protocol feed generator: a public feed skeleton, a personalized timeline
//! behind bearer authentication, and the static metadata a feed generator
//! publishes about itself.
//!
//! # Architecture
//!
//! - **AppState**: Shared state (post store, configuration, relevance source,
//!   firehose connection state)
//! - **Auth**: Bearer token verification and middleware
//! - **Routes**: Endpoint handlers grouped by concern

mod auth;
mod error;
mod routes;
mod state;

pub use self::auth::{AuthError, AuthenticatedIdentity, require_auth, verify_bearer};
pub use self::error::ApiError;
pub use self::routes::router;
pub use self::state::{AppState, Config};
