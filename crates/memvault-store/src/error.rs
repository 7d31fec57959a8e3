//! Error types for memvault-store.

use thiserror::Error;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum Error {
    /// SQLite database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization / deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote transport error
    #[error("network error: {0}")]
    Network(String),

    /// Deadline expired
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Blob or record not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Persisted payload carries an unknown schema version
    #[error("unsupported schema version {0}")]
    UnsupportedSchema(u64),

    /// General storage failure
    #[error("storage error: {0}")]
    Storage(String),
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, Error>;
