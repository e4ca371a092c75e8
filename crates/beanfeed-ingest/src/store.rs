//! Post store: the authoritative set of coffee posts.
//!
//! This module provides the [`PostStore`] which holds every accepted
//! [`BeanPost`] in insertion order and mirrors it to a single JSON file.
//!
//! # Consistency
//!
//! - Mutations (insert, evict, clear) hold the writer lock for their whole
//!   duration, including the disk write, so they never interleave.
//! - Readers get an `Arc<Vec<BeanPost>>` snapshot. Writers publish a new vector
//!   instead of editing a shared one, so a snapshot never changes underneath
//!   its holder.
//!
//! # Persistence
//!
//! The file is a JSON array of posts, rewritten in full after every mutation
//! (temp file + rename). If a write fails the in-memory state has already
//! changed and stays authoritative; the error is returned to the caller and
//! the next successful write (or a restart) brings disk and memory back in
//! line.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use beanfeed_core::BeanPost;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Thread-safe post store shared by the ingestor and request handlers.
pub struct PostStore {
    /// Backing file. `None` for purely in-memory stores.
    path: Option<PathBuf>,
    /// Current published state.
    posts: RwLock<Arc<Vec<BeanPost>>>,
    /// URIs currently stored. The lock doubles as the single-writer guard.
    writer: Mutex<HashSet<String>>,
}

impl PostStore {
    /// Open or create a store backed by the JSON file at `path`.
    ///
    /// A missing or empty file yields an empty store. If the file lists the same
    /// URI more than once, the first occurrence wins.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening post store at {}", path.display());

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let loaded: Vec<BeanPost> = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut index = HashSet::with_capacity(loaded.len());
        let mut posts = Vec::with_capacity(loaded.len());
        for post in loaded {
            if index.insert(post.uri.clone()) {
                posts.push(post);
            }
        }

        info!("Post store loaded: {} posts", posts.len());

        Ok(Self {
            path: Some(path),
            posts: RwLock::new(Arc::new(posts)),
            writer: Mutex::new(index),
        })
    }

    /// Create a store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            posts: RwLock::new(Arc::new(Vec::new())),
            writer: Mutex::new(HashSet::new()),
        }
    }

    /// Insert a post unless its URI is already stored.
    ///
    /// Returns `Ok(true)` if the post was added, `Ok(false)` if the URI already
    /// existed (no mutation, no write). An `Err` means the post was added in
    /// memory but the durable write failed.
    pub fn insert(&self, post: BeanPost) -> Result<bool> {
        let mut index = self.writer.lock();
        if index.contains(&post.uri) {
            return Ok(false);
        }

        index.insert(post.uri.clone());
        let snapshot = {
            let mut posts = self.posts.write();
            Arc::make_mut(&mut posts).push(post);
            Arc::clone(&posts)
        };

        self.persist(&snapshot)?;
        Ok(true)
    }

    /// Point-in-time view of every stored post, in insertion order.
    pub fn snapshot(&self) -> Arc<Vec<BeanPost>> {
        Arc::clone(&self.posts.read())
    }

    /// Look up a post by URI.
    pub fn find_by_uri(&self, uri: &str) -> Option<BeanPost> {
        self.snapshot().iter().find(|post| post.uri == uri).cloned()
    }

    /// Number of stored posts.
    pub fn count(&self) -> usize {
        self.posts.read().len()
    }

    /// Remove posts whose `createdAt` is older than `now - retention`.
    ///
    /// Posts with an unparsable `createdAt` are kept. Persists only when
    /// something was removed. Returns the number of posts evicted.
    pub fn evict_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> Result<usize> {
        let cutoff = now - retention;

        let mut index = self.writer.lock();
        let current = self.snapshot();

        let (kept, expired): (Vec<&BeanPost>, Vec<&BeanPost>) = current
            .iter()
            .partition(|post| post.created_at_time().is_none_or(|created| created >= cutoff));

        if expired.is_empty() {
            return Ok(0);
        }

        for post in &expired {
            index.remove(&post.uri);
        }
        let evicted = expired.len();

        let next = Arc::new(kept.into_iter().cloned().collect::<Vec<_>>());
        *self.posts.write() = Arc::clone(&next);

        debug!(evicted, cutoff = %cutoff, "evicted expired posts");
        self.persist(&next)?;
        Ok(evicted)
    }

    /// Remove every post and persist the empty store.
    pub fn clear(&self) -> Result<()> {
        let mut index = self.writer.lock();
        index.clear();

        let empty = Arc::new(Vec::new());
        *self.posts.write() = Arc::clone(&empty);

        self.persist(&empty)
    }

    /// Write `posts` to the backing file via a temp file and rename.
    fn persist(&self, posts: &[BeanPost]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let bytes = serde_json::to_vec(posts)?;
        let tmp_path = path.with_extension("json.tmp");

        fs::write(&tmp_path, &bytes)
            .and_then(|()| fs::rename(&tmp_path, path))
            .map_err(|source| Error::Persist {
                path: path.clone(),
                source,
            })
    }
}

/// Run the retention sweep: once immediately, then every `interval`.
///
/// Stops when `shutdown` flips to `true` or its sender is dropped.
pub async fn run_eviction_loop(
    store: Arc<PostStore>,
    interval: Duration,
    retention: chrono::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        interval_secs = interval.as_secs(),
        retention_hours = retention.num_hours(),
        "retention sweeper started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match store.evict_expired(Utc::now(), retention) {
            Ok(0) => debug!("retention sweep: nothing expired"),
            Ok(evicted) => {
                info!(evicted, remaining = store.count(), "retention sweep complete");
                metrics::counter!("store_evicted_total").increment(evicted as u64);
            }
            Err(e) => error!(error = %e, "retention sweep failed to persist"),
        }
        metrics::gauge!("store_posts").set(store.count() as f64);
    }

    info!("retention sweeper stopped");
}
