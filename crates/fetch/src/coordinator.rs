//! Deduplicating fetch coordination.
//!
//! The coordinator guarantees at most one download task per resource at any
//! instant. State lives in a fixed array of 128 shards, each a mutex over a
//! recent-failure set and an in-progress map; the shard count keeps the
//! accidental collision probability for the expected concurrent-miss count
//! well under 1%. Cross-shard operations never hold two shard locks, so no
//! lock ordering is needed.
//!
//! Download tasks address their shard by index rather than by reference, so
//! tasks and the table never form an ownership cycle.

use crate::download;
use crate::select::select_upstream;
use depot_cache::{AtomicWriter, DiskCache};
use depot_core::ResourceKey;
use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};

/// Number of fetch-state shards. Tunable; any power of two works.
const FETCH_SHARDS: usize = 128;

/// Completion handle for an in-flight download.
///
/// The handle never fails observably: when a download errors, the entry
/// simply leaves the in-flight table and the key joins the failure set.
#[derive(Clone)]
pub struct CompletionHandle {
    rx: watch::Receiver<bool>,
}

impl CompletionHandle {
    /// Wrap a watch receiver whose value flips to `true` on completion.
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Non-blocking completion query.
    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the download task has finished (successfully or not).
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Shared state of one in-flight download.
#[derive(Clone)]
pub struct DownloadState {
    key: ResourceKey,
    content_length: u64,
    staging_path: PathBuf,
    handle: CompletionHandle,
}

impl DownloadState {
    /// The resource being downloaded.
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Compressed length reported by the upstream HEAD probe.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// The growing staging file readers may serve from.
    pub fn staging_path(&self) -> &PathBuf {
        &self.staging_path
    }

    /// Completion handle for this download.
    pub fn handle(&self) -> CompletionHandle {
        self.handle.clone()
    }
}

/// Outcome of a fetch attempt.
pub enum FetchOutcome {
    /// A download is in flight (freshly started or joined); the caller may
    /// stream from its staging file.
    Download(DownloadState),
    /// No storage server currently advertises the resource. Nothing is
    /// recorded; a later attempt may succeed.
    NoUpstream,
    /// The key recently failed (hash mismatch or download error) and is not
    /// retried until failures are forgotten.
    Failed,
}

#[derive(Default)]
struct Shard {
    failed: HashSet<ResourceKey>,
    inprogress: HashMap<ResourceKey, DownloadState>,
}

/// Deduplicating fetch coordinator.
pub struct FetchCoordinator {
    shards: Vec<Mutex<Shard>>,
    client: reqwest::Client,
    cache: Arc<DiskCache>,
    writer: AtomicWriter,
    probe_timeout: Duration,
    probe_retries: u32,
    fetch_hits: AtomicU64,
    fetch_failures: AtomicU64,
    bytes_fetched: AtomicU64,
    inflight: AtomicI64,
}

impl FetchCoordinator {
    /// Create a coordinator over the given cache and staging writer.
    pub fn new(
        cache: Arc<DiskCache>,
        writer: AtomicWriter,
        client: reqwest::Client,
        probe_timeout: Duration,
        probe_retries: u32,
    ) -> Self {
        Self {
            shards: (0..FETCH_SHARDS).map(|_| Mutex::default()).collect(),
            client,
            cache,
            writer,
            probe_timeout,
            probe_retries,
            fetch_hits: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            bytes_fetched: AtomicU64::new(0),
            inflight: AtomicI64::new(0),
        }
    }

    /// Fetch a resource: join the in-flight download if one exists,
    /// otherwise select an upstream and start one.
    ///
    /// All concurrent callers for the same key observe the same
    /// [`DownloadState`] and share one backing file.
    ///
    /// # Panics
    ///
    /// Panics if `servers` is empty; callers validate configuration first.
    pub async fn fetch(self: &Arc<Self>, key: &ResourceKey, servers: &[String]) -> FetchOutcome {
        assert!(!servers.is_empty(), "fetch requires at least one storage server");

        let shard_idx = shard_index(key);
        let mut shard = self.shards[shard_idx].lock().await;

        if shard.failed.contains(key) {
            return FetchOutcome::Failed;
        }
        if let Some(state) = shard.inprogress.get(key) {
            return FetchOutcome::Download(state.clone());
        }

        let Some(hit) = select_upstream(
            &self.client,
            key,
            servers,
            self.probe_timeout,
            self.probe_retries,
        )
        .await
        else {
            // A transient empty selection is not a download failure.
            return FetchOutcome::NoUpstream;
        };

        let staged = match self.writer.begin(key).await {
            Ok(staged) => staged,
            Err(e) => {
                tracing::error!(resource = %key, error = %e, "failed to open staging file");
                return FetchOutcome::Failed;
            }
        };

        let (tx, rx) = watch::channel(false);
        let state = DownloadState {
            key: key.clone(),
            content_length: hit.content_length,
            staging_path: staged.path().to_path_buf(),
            handle: CompletionHandle::new(rx),
        };
        shard.inprogress.insert(key.clone(), state.clone());
        drop(shard);

        self.inflight.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        let key = key.clone();
        tokio::spawn(async move {
            let result = download::run(
                &this.client,
                &hit.server,
                &key,
                staged,
                &this.cache,
                &this.writer,
                &this.bytes_fetched,
            )
            .await;

            {
                let mut shard = this.shards[shard_idx].lock().await;
                shard.inprogress.remove(&key);
                match &result {
                    Ok(dest) => {
                        this.fetch_hits.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(resource = %key, path = %dest.display(), "download committed");
                    }
                    Err(e) => {
                        shard.failed.insert(key.clone());
                        this.fetch_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(resource = %key, error = %e, "download failed");
                    }
                }
            }
            this.inflight.fetch_sub(1, Ordering::Relaxed);
            // Shard bookkeeping is done before the handle flips, so a
            // subsequent fetch for the key observes the final state.
            let _ = tx.send(true);
        });

        FetchOutcome::Download(state)
    }

    /// Clear all recorded failures, making those keys retryable.
    /// Returns the number of keys cleared.
    pub async fn forget_failures(&self) -> usize {
        let mut cleared = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().await;
            cleared += shard.failed.len();
            shard.failed.clear();
        }
        cleared
    }

    /// Successful downloads since startup.
    pub fn fetch_hits(&self) -> u64 {
        self.fetch_hits.load(Ordering::Relaxed)
    }

    /// Failed downloads since startup.
    pub fn fetch_failures(&self) -> u64 {
        self.fetch_failures.load(Ordering::Relaxed)
    }

    /// Compressed bytes pulled from upstreams since startup.
    pub fn bytes_fetched(&self) -> u64 {
        self.bytes_fetched.load(Ordering::Relaxed)
    }

    /// Download tasks currently running.
    pub fn downloads_inflight(&self) -> i64 {
        self.inflight.load(Ordering::Relaxed)
    }
}

fn shard_index(key: &ResourceKey) -> usize {
    let mut hasher = DefaultHasher::new();
    Hash::hash(key, &mut hasher);
    (hasher.finish() % FETCH_SHARDS as u64) as usize
}
