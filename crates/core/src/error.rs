//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid resource path: {0}")]
    InvalidResourcePath(String),

    #[error("invalid tree hash: {0}")]
    InvalidHash(String),

    #[error("malformed tar stream: {0}")]
    MalformedTar(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
