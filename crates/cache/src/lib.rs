//! Bounded on-disk LRU cache with atomic install.
//!
//! Two pieces:
//! - [`DiskCache`]: size-budgeted LRU over files the cache exclusively owns,
//!   with in-use pinning so served files are never evicted mid-transfer.
//! - [`AtomicWriter`]: staged writes under a temp root committed into the
//!   cache by rename, so observers never see partial files.

pub mod atomic;
pub mod error;
pub mod lru;

pub use atomic::{AtomicWriter, StagedFile};
pub use error::{CacheError, CacheResult};
pub use lru::{DiskCache, PinnedEntry};
