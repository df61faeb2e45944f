//! Fetch error types.
//!
//! Failures are captured here and never unwind past the download task;
//! callers translate them into HTTP statuses.

use thiserror::Error;

/// Fetch layer error type.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream {server} answered {status}")]
    Upstream { server: String, status: u16 },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decompression error: {0}")]
    Decode(std::io::Error),

    #[error(
        "hash mismatch for {key}: got {skip_empty} (skip-empty) / {no_skip} (canonical)"
    )]
    HashMismatch {
        key: String,
        skip_empty: String,
        no_skip: String,
    },

    #[error("tar error: {0}")]
    Tar(#[from] depot_core::Error),

    #[error("cache error: {0}")]
    Cache(#[from] depot_cache::CacheError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for fetch operations.
pub type FetchResult<T> = std::result::Result<T, FetchError>;
