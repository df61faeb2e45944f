//! Bounded on-disk LRU cache.
//!
//! The cache exclusively owns every file under its root directory. A single
//! cache-wide mutex covers bookkeeping and eviction decisions; file deletion
//! during eviction happens under that lock. Entries currently pinned by a
//! serving handler are never evicted, even when that forces the budget to be
//! exceeded until the next reservation.

use depot_core::ResourceKey;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

struct Entry {
    path: PathBuf,
    size: u64,
    last_access: u64,
    seq: u64,
    pins: u32,
}

struct CacheInner {
    entries: HashMap<String, Entry>,
    /// Reserved-but-uncommitted sizes, keyed like entries. Counted in
    /// `total` so concurrent reservations evict around each other, but
    /// never evictable themselves (there is no file yet).
    pending: HashMap<String, u64>,
    /// Committed plus reserved bytes.
    total: u64,
    /// Logical clock for recency; ties broken by insertion sequence.
    clock: u64,
    seq: u64,
}

/// On-disk LRU cache keyed by resource storage key.
pub struct DiskCache {
    root: PathBuf,
    limit: u64,
    inner: Mutex<CacheInner>,
    evictions: AtomicU64,
}

impl DiskCache {
    /// Create a cache rooted at `root` with a total size budget of `limit`
    /// bytes. The root directory is created if missing.
    pub fn new(root: impl AsRef<Path>, limit: u64) -> crate::CacheResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            limit,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                pending: HashMap::new(),
                total: 0,
                clock: 0,
                seq: 0,
            }),
            evictions: AtomicU64::new(0),
        })
    }

    /// The destination path a key commits to.
    pub fn destination(&self, key: &ResourceKey) -> PathBuf {
        self.root.join(key.storage_key())
    }

    /// Current on-disk location of a resident key, without touching recency.
    pub fn path_of(&self, key: &ResourceKey) -> Option<PathBuf> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.get(&key.storage_key()).map(|e| e.path.clone())
    }

    /// Whether a key is resident.
    pub fn contains(&self, key: &ResourceKey) -> bool {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.contains_key(&key.storage_key())
    }

    /// Update a resident key's recency.
    pub fn touch(&self, key: &ResourceKey) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.clock += 1;
        let now = inner.clock;
        if let Some(entry) = inner.entries.get_mut(&key.storage_key()) {
            entry.last_access = now;
        }
    }

    /// Pin a resident key for serving: touches recency, increments the
    /// in-use refcount, and returns the path, size, and a guard whose drop
    /// releases the pin on every exit path.
    pub fn pin(self: &Arc<Self>, key: &ResourceKey) -> Option<PinnedEntry> {
        let storage_key = key.storage_key();
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.clock += 1;
        let now = inner.clock;
        let entry = inner.entries.get_mut(&storage_key)?;
        entry.last_access = now;
        entry.pins += 1;
        Some(PinnedEntry {
            path: entry.path.clone(),
            size: entry.size,
            _guard: PinGuard {
                cache: Arc::clone(self),
                storage_key,
            },
        })
    }

    /// Reserve room for `size` bytes under `key`, evicting least-recently
    /// used entries (and deleting their files) until the projected total
    /// fits. Returns the destination path the caller must atomically move
    /// the staged content into; parent directories are created.
    ///
    /// The reserved size counts against the budget immediately, so a
    /// concurrent reservation for another key evicts around it. The
    /// reservation is settled by [`commit`](Self::commit) or released by
    /// [`cancel_reservation`](Self::cancel_reservation).
    ///
    /// Pinned entries are skipped; if that leaves the projected total over
    /// budget the reservation still proceeds and the excess is logged.
    pub fn reserve(&self, key: &ResourceKey, size: u64) -> crate::CacheResult<PathBuf> {
        let storage_key = key.storage_key();
        let mut inner = self.inner.lock().expect("cache lock poisoned");

        // Re-reserving an existing key replaces it in place.
        if let Some(old) = inner.entries.remove(&storage_key) {
            inner.total -= old.size;
        }

        while inner.total + size > self.limit {
            let victim = inner
                .entries
                .iter()
                .filter(|(_, e)| e.pins == 0)
                .min_by_key(|(_, e)| (e.last_access, e.seq))
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else {
                tracing::warn!(
                    resource = %key,
                    needed = size,
                    resident = inner.total,
                    limit = self.limit,
                    "all cache entries pinned, reservation exceeds budget"
                );
                break;
            };
            let entry = inner.entries.remove(&victim).expect("victim just found");
            inner.total -= entry.size;
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(resource = %victim, size = entry.size, "evicting cache entry");
            if let Err(e) = std::fs::remove_file(&entry.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %entry.path.display(), error = %e, "failed to delete evicted file");
                }
            }
        }

        let dest = self.root.join(&storage_key);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(prev) = inner.pending.insert(storage_key, size) {
            inner.total -= prev;
        }
        inner.total += size;
        Ok(dest)
    }

    /// Release a reservation whose install will not happen.
    pub fn cancel_reservation(&self, key: &ResourceKey) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(reserved) = inner.pending.remove(&key.storage_key()) {
            inner.total -= reserved;
        }
    }

    /// Record a committed install of `size` bytes under `key`, settling the
    /// reservation. Called after the staged file has been renamed onto the
    /// destination path.
    pub fn commit(&self, key: &ResourceKey, size: u64) {
        let storage_key = key.storage_key();
        let path = self.root.join(&storage_key);
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(reserved) = inner.pending.remove(&storage_key) {
            inner.total -= reserved;
        }
        inner.clock += 1;
        inner.seq += 1;
        let (now, seq) = (inner.clock, inner.seq);
        if let Some(old) = inner.entries.insert(
            storage_key,
            Entry {
                path,
                size,
                last_access: now,
                seq,
                pins: 0,
            },
        ) {
            inner.total -= old.size;
        }
        inner.total += size;
    }

    /// Remove a resident entry and delete its file.
    pub fn forget(&self, key: &ResourceKey) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(entry) = inner.entries.remove(&key.storage_key()) {
            inner.total -= entry.size;
            if let Err(e) = std::fs::remove_file(&entry.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %entry.path.display(), error = %e, "failed to delete forgotten file");
                }
            }
        }
    }

    /// Total bytes of resident entries plus open reservations.
    pub fn resident_bytes(&self) -> u64 {
        self.inner.lock().expect("cache lock poisoned").total
    }

    /// Number of resident entries.
    pub fn entry_count(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    /// Lifetime eviction count.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn unpin(&self, storage_key: &str) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(entry) = inner.entries.get_mut(storage_key) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }
}

/// A pinned cache entry held for the duration of a serving handler.
pub struct PinnedEntry {
    path: PathBuf,
    size: u64,
    _guard: PinGuard,
}

impl PinnedEntry {
    /// On-disk path of the pinned file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Committed size of the pinned file.
    pub fn size(&self) -> u64 {
        self.size
    }
}

struct PinGuard {
    cache: Arc<DiskCache>,
    storage_key: String,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.cache.unpin(&self.storage_key);
    }
}
