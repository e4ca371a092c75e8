//! Application state and configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use beanfeed_core::{HashRelevance, RETENTION_HOURS, RelevanceSource};
use beanfeed_ingest::firehose::DEFAULT_FIREHOSE_URL;
use beanfeed_ingest::{FirehoseConfig, IngestorState, PostStore, ReconnectPolicy};
use tokio::sync::watch;

/// Collection NSID of feed generator records.
const FEED_GENERATOR_NSID: &str = "app.bsky.feed.generator";

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:3000").
    pub bind_addr: String,

    /// Public hostname the service is reachable at.
    pub hostname: String,

    /// DID of this feed generator service.
    pub service_did: String,

    /// DID of the account that publishes the feed record.
    pub publisher_did: String,

    /// Record key of the feed (`at://<publisher>/app.bsky.feed.generator/<name>`).
    pub feed_name: String,

    /// Firehose WebSocket URL.
    pub firehose_url: String,

    /// Location of the persisted post store.
    pub data_path: PathBuf,

    /// How long posts are kept, measured from `createdAt`.
    pub retention: chrono::Duration,

    /// How often the retention sweep runs.
    pub eviction_interval: Duration,

    /// Base delay between firehose reconnect attempts.
    pub reconnect_delay: Duration,

    /// Cap for exponential reconnect backoff. Zero keeps the delay fixed.
    pub reconnect_max_delay: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `BEANFEED_BIND_ADDR`: Server bind address (default: "0.0.0.0:3000")
    /// - `BEANFEED_HOSTNAME`: Public hostname (default: "localhost")
    /// - `BEANFEED_SERVICE_DID`: Service DID (default: "did:web:<hostname>")
    /// - `BEANFEED_PUBLISHER_DID`: Feed publisher DID (default: service DID)
    /// - `BEANFEED_FEED_NAME`: Feed record key (default: "coffee")
    /// - `BEANFEED_FIREHOSE_URL`: Relay subscribeRepos URL
    /// - `BEANFEED_DATA_PATH`: Store file (default: "./data/posts.json")
    /// - `BEANFEED_RETENTION_HOURS`: Post retention (default: 18)
    /// - `BEANFEED_EVICTION_INTERVAL_SECS`: Sweep interval (default: 600)
    /// - `BEANFEED_RECONNECT_DELAY_SECS`: Reconnect delay (default: 3)
    /// - `BEANFEED_RECONNECT_MAX_DELAY_SECS`: Backoff cap, 0 = fixed (default: 0)
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr =
            std::env::var("BEANFEED_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let hostname =
            std::env::var("BEANFEED_HOSTNAME").unwrap_or_else(|_| "localhost".to_string());

        let service_did = non_empty_var("BEANFEED_SERVICE_DID")
            .unwrap_or_else(|| format!("did:web:{hostname}"));

        let publisher_did =
            non_empty_var("BEANFEED_PUBLISHER_DID").unwrap_or_else(|| service_did.clone());

        let feed_name = non_empty_var("BEANFEED_FEED_NAME").unwrap_or_else(|| "coffee".to_string());

        let firehose_url = std::env::var("BEANFEED_FIREHOSE_URL")
            .unwrap_or_else(|_| DEFAULT_FIREHOSE_URL.to_string());

        let data_path = std::env::var("BEANFEED_DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/posts.json"));

        let retention_hours: i64 = parse_var("BEANFEED_RETENTION_HOURS", RETENTION_HOURS)?;
        if retention_hours <= 0 {
            anyhow::bail!("BEANFEED_RETENTION_HOURS must be positive");
        }

        let eviction_interval_secs: u64 = parse_var("BEANFEED_EVICTION_INTERVAL_SECS", 600)?;
        if eviction_interval_secs == 0 {
            anyhow::bail!("BEANFEED_EVICTION_INTERVAL_SECS must be positive");
        }

        let reconnect_delay_secs: u64 = parse_var("BEANFEED_RECONNECT_DELAY_SECS", 3)?;
        let reconnect_max_delay_secs: u64 = parse_var("BEANFEED_RECONNECT_MAX_DELAY_SECS", 0)?;

        tracing::info!(
            bind_addr = %bind_addr,
            service_did = %service_did,
            feed_name = %feed_name,
            firehose_url = %firehose_url,
            data_path = %data_path.display(),
            retention_hours,
            "configuration loaded"
        );

        Ok(Self {
            bind_addr,
            hostname,
            service_did,
            publisher_did,
            feed_name,
            firehose_url,
            data_path,
            retention: chrono::Duration::hours(retention_hours),
            eviction_interval: Duration::from_secs(eviction_interval_secs),
            reconnect_delay: Duration::from_secs(reconnect_delay_secs),
            reconnect_max_delay: Duration::from_secs(reconnect_max_delay_secs),
        })
    }

    /// AT URI of the feed generator record this service answers for.
    pub fn feed_uri(&self) -> String {
        format!(
            "at://{}/{}/{}",
            self.publisher_did, FEED_GENERATOR_NSID, self.feed_name
        )
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        if self.reconnect_max_delay > self.reconnect_delay {
            ReconnectPolicy::exponential(self.reconnect_delay, self.reconnect_max_delay)
                .with_jitter(0.2)
        } else {
            ReconnectPolicy::fixed(self.reconnect_delay)
        }
    }

    pub fn firehose_config(&self) -> FirehoseConfig {
        FirehoseConfig {
            url: self.firehose_url.clone(),
            reconnect: self.reconnect_policy(),
            ..FirehoseConfig::default()
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty_var(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{key} has invalid value {raw:?}")),
        None => Ok(default),
    }
}

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The post store fed by the ingestor.
    pub store: Arc<PostStore>,

    /// Application configuration.
    pub config: Arc<Config>,

    /// Follow-relationship lookup for the personalized timeline.
    pub relevance: Arc<dyn RelevanceSource>,

    /// Live firehose connection state.
    pub firehose: watch::Receiver<IngestorState>,
}

impl AppState {
    /// Create state with the default [`HashRelevance`] placeholder.
    pub fn new(
        config: Config,
        store: Arc<PostStore>,
        firehose: watch::Receiver<IngestorState>,
    ) -> Self {
        Self {
            store,
            config: Arc::new(config),
            relevance: Arc::new(HashRelevance::default()),
            firehose,
        }
    }

    /// Replace the relevance source.
    pub fn with_relevance(mut self, relevance: Arc<dyn RelevanceSource>) -> Self {
        self.relevance = relevance;
        self
    }
}
