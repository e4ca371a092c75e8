//! Firehose ingestor.
//!
//! Holds one WebSocket connection to the relay, turns binary frames into
//! coffee posts and inserts them into the [`PostStore`]. Lost or failed
//! connections are retried forever using the configured [`ReconnectPolicy`].
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──handshake ok──▶ Connected
//!       ▲                        │                           │
//!       └──── backoff delay ◀────┴──── error / close / EOF ◀─┘
//! ```
//!
//! The current state is published on a `watch` channel. `shutdown()` stops the
//! loop from any state: the live socket is closed and a pending reconnect
//! wait is cut short.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use beanfeed_core::{BEAN_POST_NSID, RecordOutcome, validate_record};
use chrono::{SecondsFormat, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use super::backoff::{ReconnectBackoff, ReconnectPolicy};
use super::codec::{CommitDecoder, Frame};
use crate::error::{Error, Result};
use crate::store::PostStore;

/// Default relay endpoint.
pub const DEFAULT_FIREHOSE_URL: &str = "wss://bsky.network/xrpc/com.atproto.sync.subscribeRepos";

/// Configuration for the firehose connection.
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    /// WebSocket URL of `com.atproto.sync.subscribeRepos`.
    pub url: String,

    /// Delay policy between reconnect attempts.
    pub reconnect: ReconnectPolicy,

    /// Upper bound on the WebSocket handshake.
    pub connect_timeout: Duration,

    /// How often to ping the relay while connected.
    pub ping_interval: Duration,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FIREHOSE_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Connection state of the ingestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestorState {
    Disconnected,
    Connecting,
    Connected,
}

impl IngestorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl std::fmt::Display for IngestorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a single frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame could not be decoded.
    Dropped,
    /// A well-formed frame that carries no commit (identity, info, error).
    Ignored,
    /// A commit was processed.
    Commit(CommitSummary),
}

/// Per-commit record counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    /// Records added in memory whose durable write failed.
    pub store_errors: usize,
    /// Coffee-post blocks that could not be decoded.
    pub undecodable: usize,
}

/// Counters since the ingestor was created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestorStats {
    pub frames: u64,
    pub commits: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub decode_failures: u64,
    pub store_errors: u64,
    pub reconnects: u64,
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    commits: AtomicU64,
    accepted: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    decode_failures: AtomicU64,
    store_errors: AtomicU64,
    reconnects: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> IngestorStats {
        IngestorStats {
            frames: self.frames.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// How a connection ended without a transport error.
enum ConnectionEnd {
    Shutdown,
    Lost,
}

/// Background firehose consumer.
pub struct FirehoseIngestor {
    config: FirehoseConfig,
    store: Arc<PostStore>,
    decoder: Arc<dyn CommitDecoder>,
    state: watch::Sender<IngestorState>,
    shutdown: watch::Sender<bool>,
    counters: Counters,
}

impl FirehoseIngestor {
    pub fn new(
        config: FirehoseConfig,
        store: Arc<PostStore>,
        decoder: Arc<dyn CommitDecoder>,
    ) -> Self {
        let (state, _) = watch::channel(IngestorState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store,
            decoder,
            state,
            shutdown,
            counters: Counters::default(),
        }
    }

    pub fn state(&self) -> IngestorState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<IngestorState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> IngestorStats {
        self.counters.snapshot()
    }

    /// Ask [`run`](Self::run) to stop. Safe to call at any time, including
    /// before `run` starts.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_state(&self, next: IngestorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            trace!(from = %previous, to = %next, "firehose state changed");
        }
        metrics::gauge!("firehose_connected").set(if next == IngestorState::Connected {
            1.0
        } else {
            0.0
        });
    }

    /// Connect and consume frames until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = self.config.reconnect.backoff();

        info!(url = %self.config.url, "starting firehose ingestor");

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(IngestorState::Connecting);
            match self.connect_and_listen(&mut shutdown, &mut backoff).await {
                Ok(ConnectionEnd::Shutdown) => break,
                Ok(ConnectionEnd::Lost) => info!("firehose connection closed"),
                Err(e) => warn!(error = %e, "firehose connection failed"),
            }
            self.set_state(IngestorState::Disconnected);

            if *shutdown.borrow() {
                break;
            }

            let delay = backoff.record_failure();
            Counters::bump(&self.counters.reconnects);
            metrics::counter!("firehose_reconnects_total").increment(1);

            if backoff.should_alarm() {
                error!(
                    failures = backoff.consecutive_failures(),
                    "firehose unreachable, reconnecting in {:?}", delay
                );
            } else {
                info!(
                    attempt = backoff.consecutive_failures(),
                    "reconnecting to firehose in {:?}", delay
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!("shutdown requested during reconnect wait");
                }
            }
        }

        self.set_state(IngestorState::Disconnected);
        info!("firehose ingestor stopped");
    }

    async fn connect_and_listen(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut ReconnectBackoff,
    ) -> Result<ConnectionEnd> {
        let timeout = self.config.connect_timeout;
        let (ws_stream, _) = tokio::select! {
            connected = tokio::time::timeout(timeout, connect_async(self.config.url.as_str())) => {
                connected.map_err(|_| Error::ConnectTimeout(timeout))??
            }
            _ = shutdown.changed() => return Ok(ConnectionEnd::Shutdown),
        };

        self.set_state(IngestorState::Connected);
        backoff.reset();
        info!(url = %self.config.url, "connected to firehose");

        let (mut write, mut read) = ws_stream.split();
        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("closing firehose connection");
                    let _ = write.close().await;
                    return Ok(ConnectionEnd::Shutdown);
                }

                _ = ping_interval.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            // Accepted posts are written to disk before returning
                            tokio::task::block_in_place(|| self.handle_frame(&data));
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "relay sent close frame");
                            return Ok(ConnectionEnd::Lost);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(ConnectionEnd::Lost),
                    }
                }
            }
        }
    }

    /// Process one binary frame to completion.
    pub fn handle_frame(&self, bytes: &[u8]) -> FrameOutcome {
        Counters::bump(&self.counters.frames);
        metrics::counter!("firehose_frames_total").increment(1);

        let commit = match self.decoder.decode_frame(bytes) {
            Ok(Frame::Commit(commit)) => commit,
            Ok(Frame::Error { error, message }) => {
                warn!(error = %error, message = message.as_deref().unwrap_or(""), "relay sent error frame");
                return FrameOutcome::Ignored;
            }
            Ok(Frame::Other(kind)) => {
                trace!(kind = %kind, "skipping non-commit frame");
                return FrameOutcome::Ignored;
            }
            Err(e) => {
                debug!(error = %e, "dropping undecodable frame");
                Counters::bump(&self.counters.decode_failures);
                metrics::counter!("firehose_frames_dropped_total", "reason" => "decode")
                    .increment(1);
                return FrameOutcome::Dropped;
            }
        };

        Counters::bump(&self.counters.commits);
        let mut summary = CommitSummary::default();

        let relevant = commit
            .ops
            .iter()
            .filter(|op| op.is_create() && op.collection() == BEAN_POST_NSID);

        for op in relevant {
            let Some(cid) = op.cid.as_deref() else {
                continue;
            };

            let payload = match self.decoder.decode_block(&commit, cid) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(repo = %commit.repo, path = %op.path, too_big = commit.too_big, error = %e, "skipping undecodable block");
                    summary.undecodable += 1;
                    Counters::bump(&self.counters.decode_failures);
                    metrics::counter!("firehose_frames_dropped_total", "reason" => "block")
                        .increment(1);
                    continue;
                }
            };

            let mut post = match validate_record(&payload, &commit.repo, &op.path, cid) {
                RecordOutcome::Accepted(post) => post,
                RecordOutcome::Malformed(rejection) => {
                    debug!(repo = %commit.repo, path = %op.path, %rejection, "rejected coffee post");
                    summary.rejected += 1;
                    Counters::bump(&self.counters.rejected);
                    metrics::counter!("firehose_records_rejected_total", "reason" => rejection.label())
                        .increment(1);
                    continue;
                }
                RecordOutcome::NotApplicable => continue,
            };

            post.indexed_at = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
            let uri = post.uri.clone();

            match self.store.insert(post) {
                Ok(true) => {
                    debug!(%uri, "stored coffee post");
                    summary.accepted += 1;
                    Counters::bump(&self.counters.accepted);
                    metrics::counter!("firehose_records_accepted_total").increment(1);
                }
                Ok(false) => {
                    summary.duplicates += 1;
                    Counters::bump(&self.counters.duplicates);
                    metrics::counter!("firehose_records_duplicate_total").increment(1);
                }
                Err(e) => {
                    error!(%uri, error = %e, "failed to persist coffee post");
                    summary.store_errors += 1;
                    Counters::bump(&self.counters.store_errors);
                    metrics::counter!("firehose_store_errors_total").increment(1);
                }
            }
        }

        metrics::gauge!("store_posts").set(self.store.count() as f64);
        FrameOutcome::Commit(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firehose::codec::CarCommitDecoder;
    use crate::firehose::codec::test_support::{commit_frame, error_frame, message_frame};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    fn ingestor(url: &str, delay: Duration) -> (Arc<FirehoseIngestor>, Arc<PostStore>) {
        let store = Arc::new(PostStore::in_memory());
        let config = FirehoseConfig {
            url: url.to_string(),
            reconnect: ReconnectPolicy::fixed(delay),
            connect_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(60),
        };
        let ingestor = FirehoseIngestor::new(config, Arc::clone(&store), Arc::new(CarCommitDecoder));
        (Arc::new(ingestor), store)
    }

    fn coffee(text: &str) -> Value {
        json!({
            "$type": "app.beanfeed.post",
            "text": text,
            "createdAt": "2026-10-18T07:30:00Z",
            "beanName": "Huila",
            "brewMethod": "aeropress",
        })
    }

    async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[test]
    fn test_handle_commit_frame_end_to_end() {
        let (ingestor, store) = ingestor("ws://unused", Duration::from_secs(3));
        let frame = commit_frame(
            100,
            "did:plc:barista",
            &[("app.beanfeed.post/3kx", coffee("Natural Huila on the aeropress"))],
        );

        let outcome = ingestor.handle_frame(&frame);
        assert_eq!(
            outcome,
            FrameOutcome::Commit(CommitSummary {
                accepted: 1,
                ..Default::default()
            })
        );

        let post = store
            .find_by_uri("at://did:plc:barista/app.beanfeed.post/3kx")
            .expect("post stored");
        assert_eq!(post.text, "Natural Huila on the aeropress");
        assert_eq!(post.brew_method.as_deref(), Some("aeropress"));
        assert!(post.indexed_at.is_some());
        assert!(post.cid.starts_with("bafy"));

        // Replaying the same commit is silent
        let outcome = ingestor.handle_frame(&frame);
        assert_eq!(
            outcome,
            FrameOutcome::Commit(CommitSummary {
                duplicates: 1,
                ..Default::default()
            })
        );
        assert_eq!(store.count(), 1);

        let stats = ingestor.stats();
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.commits, 2);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn test_irrelevant_records_ignored() {
        let (ingestor, store) = ingestor("ws://unused", Duration::from_secs(3));
        let frame = commit_frame(
            5,
            "did:plc:someone",
            &[
                (
                    "app.bsky.feed.post/abc",
                    json!({"$type": "app.bsky.feed.post", "text": "hi", "createdAt": "2026-10-18T07:30:00Z"}),
                ),
                (
                    "app.beanfeed.post/bad",
                    json!({"$type": "app.beanfeed.post", "createdAt": "2026-10-18T07:30:00Z"}),
                ),
                ("app.beanfeed.post/good", coffee("espresso")),
            ],
        );

        let outcome = ingestor.handle_frame(&frame);
        assert_eq!(
            outcome,
            FrameOutcome::Commit(CommitSummary {
                accepted: 1,
                rejected: 1,
                ..Default::default()
            })
        );
        assert_eq!(store.count(), 1);
        assert_eq!(ingestor.stats().rejected, 1);
    }

    #[test]
    fn test_non_commit_and_garbage_frames() {
        let (ingestor, store) = ingestor("ws://unused", Duration::from_secs(3));

        assert_eq!(ingestor.handle_frame(&message_frame("#identity")), FrameOutcome::Ignored);
        assert_eq!(
            ingestor.handle_frame(&error_frame("ConsumerTooSlow", "slow down")),
            FrameOutcome::Ignored
        );
        assert_eq!(ingestor.handle_frame(b"\xde\xad\xbe\xef"), FrameOutcome::Dropped);
        assert_eq!(ingestor.handle_frame(&[]), FrameOutcome::Dropped);

        assert_eq!(store.count(), 0);
        let stats = ingestor.stats();
        assert_eq!(stats.frames, 4);
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.decode_failures, 2);
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(IngestorState::Disconnected.as_str(), "disconnected");
        assert_eq!(IngestorState::Connecting.to_string(), "connecting");
        assert_eq!(IngestorState::Connected.as_str(), "connected");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ingests_over_websocket_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let first = commit_frame(1, "did:plc:one", &[("app.beanfeed.post/a", coffee("first cup"))]);
        let second = commit_frame(2, "did:plc:two", &[("app.beanfeed.post/b", coffee("second cup"))]);

        let server = tokio::spawn(async move {
            // First connection: one frame, then the relay hangs up
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Binary(first)).await.unwrap();
            ws.close(None).await.unwrap();

            // Second connection: one frame, then wait for the client to leave
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Binary(second)).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });

        let (ingestor, store) = ingestor(&format!("ws://{addr}"), Duration::from_millis(50));
        let mut state = ingestor.subscribe_state();
        let runner = {
            let ingestor = Arc::clone(&ingestor);
            tokio::spawn(async move { ingestor.run().await })
        };

        wait_for("both posts", || store.count() == 2).await;
        assert!(
            store
                .find_by_uri("at://did:plc:two/app.beanfeed.post/b")
                .is_some()
        );
        assert!(ingestor.stats().reconnects >= 1);
        assert_eq!(*state.borrow_and_update(), IngestorState::Connected);

        ingestor.shutdown();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ingestor.state(), IngestorState::Disconnected);

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_reconnect_wait() {
        // Grab a free port and release it so connecting fails
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let (ingestor, _store) = ingestor(&format!("ws://{addr}"), Duration::from_secs(3600));
        let runner = {
            let ingestor = Arc::clone(&ingestor);
            tokio::spawn(async move { ingestor.run().await })
        };

        wait_for("first reconnect", || ingestor.stats().reconnects == 1).await;
        assert_eq!(ingestor.state(), IngestorState::Disconnected);

        ingestor.shutdown();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(ingestor.is_shutting_down());
    }

    #[tokio::test]
    async fn test_shutdown_before_run() {
        let (ingestor, _store) = ingestor("ws://127.0.0.1:9", Duration::from_secs(3600));
        ingestor.shutdown();
        tokio::time::timeout(Duration::from_secs(5), ingestor.run())
            .await
            .unwrap();
        assert_eq!(ingestor.stats().reconnects, 0);
    }
}
