//! Resource fetching for depot.
//!
//! Three layers:
//! - [`select`]: concurrent HEAD fan-out that picks the fastest upstream
//!   actually holding a resource.
//! - [`download`]: the streaming pipeline that persists, decompresses, and
//!   tree-hashes a tarball in one pass before committing it.
//! - [`coordinator`]: the sharded table guaranteeing at most one download
//!   per resource, with join semantics and a recent-failure set.

pub mod coordinator;
mod download;
pub mod error;
pub mod select;

pub use coordinator::{CompletionHandle, DownloadState, FetchCoordinator, FetchOutcome};
pub use error::{FetchError, FetchResult};
pub use select::{ProbeHit, select_upstream};
