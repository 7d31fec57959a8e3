//! Error types for memvault-search.

use thiserror::Error;

/// Error type for vector index operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input shape; fatal to the call, never retried
    #[error("validation error: {0}")]
    Validation(String),

    /// Index corruption or internal invariant violation
    #[error("index error: {0}")]
    Index(String),

    /// Search failed (typically: no index exists for the user)
    #[error("search error: {0}")]
    Search(String),

    /// Persistence failure
    #[error("storage error: {0}")]
    Storage(#[from] memvault_store::Error),

    /// Embedding provider failure
    #[error("embedding error: {0}")]
    Embedding(#[from] memvault_embed::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Scratch-file I/O during snapshot (de)serialization
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Deadline expired
    #[error("timeout after {0}ms")]
    Timeout(u64),
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, Error>;
