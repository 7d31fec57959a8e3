//! Error types for memvault-embed.

use thiserror::Error;

/// Embedding error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Provider not configured
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    /// API error
    #[error("api error: {0}")]
    Api(String),

    /// Rate limit exhausted; retry after the given delay
    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited {
        /// How long to wait before retrying, in milliseconds
        retry_after_ms: u64,
    },

    /// Invalid response shape
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Network error
    #[error("network error: {0}")]
    Network(String),

    /// Deadline expired
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Provider-internal failure
    #[error("provider error: {0}")]
    Provider(String),
}

impl Error {
    /// Whether a retry with backoff can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
