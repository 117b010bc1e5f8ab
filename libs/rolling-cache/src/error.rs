//! Error types for the rolling cache
//!
//! `CacheError` is `Clone` because one load result is shared by every caller
//! waiting on the same key.

use thiserror::Error;

/// Failures of the historical loader collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Upstream returned status {0}")]
    Status(u16),

    #[error("Malformed history payload: {0}")]
    Decode(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache store error: {0}")]
    Store(String),

    #[error("History load failed: {0}")]
    Loader(#[from] LoaderError),

    #[error("History load for {key} timed out after {timeout_ms}ms")]
    LoadTimeout { key: String, timeout_ms: u64 },

    #[error("Failed to encode window for {key}: {reason}")]
    Encode { key: String, reason: String },
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Store(e.to_string())
    }
}
