//! Text→embedding memoization.
//!
//! Keys are a SHA-256 hash of the embedding kind and the exact text, so
//! identical content never pays for a second provider call. Collisions
//! are tolerated: the worst case is one extra embedding call.

use lru::LruCache;
use memvault_embed::EmbeddingKind;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Cache hit/miss statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that fell through to the provider
    pub misses: u64,
    /// Entries currently cached
    pub len: usize,
    /// Maximum entries
    pub capacity: usize,
}

/// LRU cache of embeddings keyed by content hash.
pub struct EmbeddingCache {
    inner: Mutex<LruCache<String, Vec<f32>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    /// Create a cache holding at most `capacity` embeddings.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn key(kind: EmbeddingKind, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Look up a cached embedding.
    pub fn get(&self, kind: EmbeddingKind, text: &str) -> Option<Vec<f32>> {
        let key = Self::key(kind, text);
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get(&key) {
            Some(embedding) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = &key[..8], "Embedding cache hit");
                Some(embedding.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store an embedding.
    pub fn put(&self, kind: EmbeddingKind, text: &str, embedding: Vec<f32>) {
        let key = Self::key(kind, text);
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(key, embedding);
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.clear();
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        let cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: cache.len(),
            capacity: cache.cap().get(),
        }
    }
}
