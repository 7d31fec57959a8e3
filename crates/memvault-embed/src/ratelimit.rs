//! Token-bucket rate limiting for the embedding budget.
//!
//! The bucket is the one piece of cross-user state in the engine:
//! capacity is the per-minute budget, refilled continuously per second.

use crate::error::{Error, Result};
use crate::provider::{EmbeddingKind, EmbeddingProvider};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

/// Continuous-refill token bucket.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket with the given per-minute budget.
    pub fn per_minute(rate: u32) -> Self {
        let capacity = rate.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();
    }

    /// Take `n` tokens, or report how long until they are available.
    pub fn try_acquire(&self, n: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state);
        let needed = n as f64;
        if state.tokens >= needed {
            state.tokens -= needed;
            Ok(())
        } else {
            let missing = needed - state.tokens;
            let retry_after_ms = (missing / self.refill_per_sec * 1000.0).ceil() as u64;
            Err(Error::RateLimited { retry_after_ms })
        }
    }

    /// Tokens currently available (after refill).
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state);
        state.tokens
    }
}

/// Provider wrapper that enforces the shared embedding budget.
///
/// Exhaustion surfaces as [`Error::RateLimited`] with the announced
/// retry-after; callers (the batch ingestion path) pause for it rather
/// than the wrapper sleeping silently.
pub struct RateLimitedProvider {
    inner: std::sync::Arc<dyn EmbeddingProvider>,
    bucket: std::sync::Arc<TokenBucket>,
}

impl RateLimitedProvider {
    /// Wrap `inner` with the given bucket.
    pub fn new(
        inner: std::sync::Arc<dyn EmbeddingProvider>,
        bucket: std::sync::Arc<TokenBucket>,
    ) -> Self {
        Self { inner, bucket }
    }
}

#[async_trait]
impl EmbeddingProvider for RateLimitedProvider {
    async fn embed(&self, text: &str, kind: EmbeddingKind) -> Result<Vec<f32>> {
        self.bucket.try_acquire(1)?;
        self.inner.embed(text, kind).await
    }

    async fn embed_batch(&self, texts: &[String], kind: EmbeddingKind) -> Result<Vec<Vec<f32>>> {
        self.bucket.try_acquire(texts.len() as u32)?;
        debug!(batch = texts.len(), "Rate budget acquired for batch");
        self.inner.embed_batch(texts, kind).await
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::HashingProvider;
    use std::sync::Arc;

    #[test]
    fn test_bucket_exhaustion_reports_retry_after() {
        let bucket = TokenBucket::per_minute(60);
        for _ in 0..60 {
            bucket.try_acquire(1).unwrap();
        }
        match bucket.try_acquire(1) {
            Err(Error::RateLimited { retry_after_ms }) => {
                assert!(retry_after_ms > 0);
                assert!(retry_after_ms <= 1_100);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn test_bucket_refills() {
        let bucket = TokenBucket::per_minute(60_000); // 1000/s for a fast test
        for _ in 0..60 {
            bucket.try_acquire(1000).unwrap();
        }
        assert!(bucket.try_acquire(1000).is_err());
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(bucket.available() > 0.0);
    }

    #[tokio::test]
    async fn test_rate_limited_provider_passthrough() {
        let inner = Arc::new(HashingProvider::new(32));
        let bucket = Arc::new(TokenBucket::per_minute(10));
        let provider = RateLimitedProvider::new(inner, bucket);

        let v = provider.embed("hello", EmbeddingKind::Content).await.unwrap();
        assert_eq!(v.len(), 32);
        assert_eq!(provider.dimensions(), 32);
        assert_eq!(provider.name(), "hashing");
    }

    #[tokio::test]
    async fn test_rate_limited_provider_exhausts() {
        let inner = Arc::new(HashingProvider::new(8));
        let bucket = Arc::new(TokenBucket::per_minute(2));
        let provider = RateLimitedProvider::new(inner, bucket);

        provider.embed("one", EmbeddingKind::Content).await.unwrap();
        provider.embed("two", EmbeddingKind::Content).await.unwrap();
        let err = provider.embed("three", EmbeddingKind::Content).await;
        assert!(matches!(err, Err(Error::RateLimited { .. })));
    }
}
