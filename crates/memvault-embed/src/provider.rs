//! Embedding provider abstraction and the deterministic local provider.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

/// What the text is being embedded for.
///
/// Retrieval-tuned models distinguish document and query inputs; the
/// kind travels with every embed call so providers can apply their
/// task prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EmbeddingKind {
    /// Memory content being indexed
    #[default]
    Content,
    /// Auxiliary metadata text
    Metadata,
    /// A search query
    Query,
}

impl std::fmt::Display for EmbeddingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Content => write!(f, "content"),
            Self::Metadata => write!(f, "metadata"),
            Self::Query => write!(f, "query"),
        }
    }
}

/// Trait for embedding providers.
///
/// Embedding providers convert text into dense vector representations
/// suitable for semantic similarity search.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text.
    async fn embed(&self, text: &str, kind: EmbeddingKind) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts.
    ///
    /// Default implementation calls `embed` sequentially; providers
    /// with a batch endpoint should override it.
    async fn embed_batch(&self, texts: &[String], kind: EmbeddingKind) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed(text, kind).await?);
        }
        Ok(embeddings)
    }

    /// The embedding dimension.
    fn dimensions(&self) -> usize;

    /// Provider name.
    fn name(&self) -> &str;

    /// Model name.
    fn model(&self) -> &str;
}

/// Shared handle to a provider.
pub type SharedEmbeddingProvider = Arc<dyn EmbeddingProvider>;

/// Deterministic token-hash embedding provider.
///
/// Projects unigrams and bigrams into hash buckets and L2-normalizes
/// the result. No model, no network, stable across runs — the offline
/// fallback and the test vehicle. Queries and documents hash
/// identically so self-similarity is exact.
pub struct HashingProvider {
    dimension: usize,
    model_name: String,
}

impl HashingProvider {
    /// Create a provider with the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model_name: format!("memvault-hash-{dimension}"),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        (hasher.finish() % self.dimension as u64) as usize
    }

    fn project(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let tokens: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        for token in &tokens {
            vector[self.bucket(token)] += 1.0;
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            vector[self.bucket(&bigram)] += 0.5;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    async fn embed(&self, text: &str, kind: EmbeddingKind) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(Error::Provider("cannot embed empty text".to_string()));
        }
        let vector = self.project(text);
        debug!(kind = %kind, dims = vector.len(), "Generated hash embedding");
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hashing"
    }

    fn model(&self) -> &str {
        &self.model_name
    }
}
