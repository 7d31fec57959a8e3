//! Error types for memvault-graph.

use thiserror::Error;

/// Errors that can occur in knowledge-graph operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Extraction backend failure (degraded to an empty result by the
    /// service; surfaced only by direct extractor calls)
    #[error("extraction error: {0}")]
    Extraction(String),

    /// Persistence failure
    #[error("storage error: {0}")]
    Storage(#[from] memvault_store::Error),

    /// Serialization / deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A graph invariant was violated (dangling endpoint, …)
    #[error("graph integrity error: {0}")]
    Integrity(String),

    /// Entity or mapping not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Deadline expired
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// General internal error
    #[error("{0}")]
    Internal(String),
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, Error>;
