//! Cache error types.

use thiserror::Error;

/// Cache layer error type.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("staging file already consumed")]
    StagingConsumed,
}

/// Result type alias for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
