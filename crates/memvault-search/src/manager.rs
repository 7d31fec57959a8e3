//! Text-level vector operations.
//!
//! The manager couples an embedding provider to the index service:
//! text in, ranked matches out. Embedding cost is amortized through the
//! [`EmbeddingCache`]; vector ids come from a per-user counter seeded
//! from the loaded index so ids are never reused across restarts.

use crate::cache::EmbeddingCache;
use crate::error::{Error, Result};
use crate::service::{HnswIndexService, MetadataFilter, SearchOptions};
use memvault_embed::{EmbeddingKind, SharedEmbeddingProvider};
use memvault_store::BlobId;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Options for [`VectorManager::add_text_to_index`].
#[derive(Clone, Default)]
pub struct AddTextOptions {
    /// Explicit vector id; auto-assigned when `None`
    pub vector_id: Option<u32>,
    /// Metadata stored with the vector
    pub metadata: Option<serde_json::Value>,
    /// Embedding kind (content, metadata, query)
    pub kind: EmbeddingKind,
    /// Consult the embedding cache (`false` forces a provider call)
    pub skip_cache: bool,
}

/// Outcome of a single text ingestion.
#[derive(Debug, Clone)]
pub struct AddTextOutcome {
    /// Assigned vector id
    pub vector_id: u32,
    /// The embedding that was indexed
    pub embedding: Vec<f32>,
    /// Whether the embedding came from the cache
    pub cache_hit: bool,
    /// Wall-clock processing time
    pub elapsed: Duration,
}

/// Options for [`VectorManager::search_similar_texts`].
#[derive(Clone)]
pub struct SearchTextOptions {
    /// Number of results
    pub k: usize,
    /// Drop matches below this similarity
    pub threshold: Option<f32>,
    /// Search expansion override
    pub ef_search: Option<usize>,
    /// Metadata predicate
    pub filter: Option<MetadataFilter>,
    /// Attach the query embedding to each match
    pub include_embedding: bool,
}

impl Default for SearchTextOptions {
    fn default() -> Self {
        Self {
            k: 10,
            threshold: None,
            ef_search: None,
            filter: None,
            include_embedding: false,
        }
    }
}

/// One ranked match.
#[derive(Debug, Clone)]
pub struct VectorSearchMatch {
    /// Matched vector id
    pub vector_id: u32,
    /// Similarity (higher is closer)
    pub similarity: f32,
    /// Raw distance in the index space
    pub distance: f32,
    /// Metadata stored with the vector
    pub metadata: serde_json::Value,
    /// The query embedding, when requested
    pub embedding: Option<Vec<f32>>,
}

/// Timing breakdown for a text search.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchTimings {
    /// Time spent embedding the query
    pub embedding_ms: u64,
    /// Time spent inside the index search
    pub index_ms: u64,
    /// End-to-end time
    pub total_ms: u64,
}

/// Text search output.
#[derive(Debug, Clone, Default)]
pub struct TextSearchResults {
    /// Matches above the threshold, best first
    pub matches: Vec<VectorSearchMatch>,
    /// Timing stats
    pub timings: SearchTimings,
}

/// One item of a batch ingestion.
#[derive(Debug, Clone)]
pub struct BatchTextItem {
    /// Text to embed and index
    pub text: String,
    /// Metadata stored with the vector
    pub metadata: Option<serde_json::Value>,
}

/// Per-item outcome of a batch ingestion.
#[derive(Debug, Clone)]
pub struct BatchItemOutcome {
    /// Position in the input
    pub index: usize,
    /// Assigned vector id on success
    pub vector_id: Option<u32>,
    /// Error message on failure
    pub error: Option<String>,
}

/// Batch ingestion options.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Items per provider call
    pub batch_size: usize,
    /// Embedding kind for all items
    pub kind: EmbeddingKind,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            kind: EmbeddingKind::Content,
        }
    }
}

/// Batch ingestion outcome.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Per-item results, input order
    pub results: Vec<BatchItemOutcome>,
    /// Items indexed successfully
    pub success_count: usize,
    /// Items that failed
    pub failure_count: usize,
    /// End-to-end time
    pub elapsed: Duration,
}

/// Couples the embedding provider to the index service.
pub struct VectorManager {
    provider: SharedEmbeddingProvider,
    service: HnswIndexService,
    cache: EmbeddingCache,
    counters: Mutex<HashMap<String, u32>>,
}

impl VectorManager {
    /// Create a manager over the given provider and index service.
    pub fn new(
        provider: SharedEmbeddingProvider,
        service: HnswIndexService,
        cache_capacity: usize,
    ) -> Self {
        Self {
            provider,
            service,
            cache: EmbeddingCache::new(cache_capacity),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying index service.
    pub fn index_service(&self) -> &HnswIndexService {
        &self.service
    }

    /// Embedding cache statistics.
    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }

    async fn embed_cached(
        &self,
        text: &str,
        kind: EmbeddingKind,
        skip_cache: bool,
    ) -> Result<(Vec<f32>, bool)> {
        if !skip_cache {
            if let Some(hit) = self.cache.get(kind, text) {
                return Ok((hit, true));
            }
        }
        let embedding = self.provider.embed(text, kind).await?;
        if !skip_cache {
            self.cache.put(kind, text, embedding.clone());
        }
        Ok((embedding, false))
    }

    /// Read-and-increment the per-user vector id counter, seeding it
    /// from the persisted index on first use.
    async fn next_vector_id(&self, user_id: &str) -> Result<u32> {
        let mut counters = self.counters.lock().await;
        let next = match counters.get(user_id) {
            Some(n) => *n,
            None => self.service.next_vector_id(user_id).await?,
        };
        counters.insert(user_id.to_string(), next + 1);
        Ok(next)
    }

    /// Embed `text` and add it to the user's index.
    pub async fn add_text_to_index(
        &self,
        user_id: &str,
        text: &str,
        options: AddTextOptions,
    ) -> Result<AddTextOutcome> {
        let started = Instant::now();
        let (embedding, cache_hit) = self.embed_cached(text, options.kind, options.skip_cache).await?;
        let vector_id = match options.vector_id {
            Some(id) => id,
            None => self.next_vector_id(user_id).await?,
        };
        self.service
            .add_vector_batched(user_id, vector_id, &embedding, options.metadata)
            .await?;
        debug!(user_id, vector_id, cache_hit, "Indexed text");
        Ok(AddTextOutcome {
            vector_id,
            embedding,
            cache_hit,
            elapsed: started.elapsed(),
        })
    }

    /// Embed a query and return matches above the threshold.
    pub async fn search_similar_texts(
        &self,
        user_id: &str,
        query: &str,
        options: SearchTextOptions,
    ) -> Result<TextSearchResults> {
        let started = Instant::now();

        let embed_started = Instant::now();
        let (embedding, _) = self.embed_cached(query, EmbeddingKind::Query, false).await?;
        let embedding_ms = embed_started.elapsed().as_millis() as u64;

        let index_started = Instant::now();
        let raw = self
            .service
            .search_vectors(
                user_id,
                &embedding,
                SearchOptions {
                    k: options.k,
                    ef_search: options.ef_search,
                    filter: options.filter.clone(),
                },
            )
            .await?;
        let index_ms = index_started.elapsed().as_millis() as u64;

        let mut matches = Vec::with_capacity(raw.ids.len());
        for i in 0..raw.ids.len() {
            let similarity = raw.similarities[i];
            if let Some(threshold) = options.threshold {
                if similarity < threshold {
                    continue;
                }
            }
            matches.push(VectorSearchMatch {
                vector_id: raw.ids[i],
                similarity,
                distance: raw.distances[i],
                metadata: raw.metadata[i].clone(),
                embedding: options.include_embedding.then(|| embedding.clone()),
            });
        }

        Ok(TextSearchResults {
            matches,
            timings: SearchTimings {
                embedding_ms,
                index_ms,
                total_ms: started.elapsed().as_millis() as u64,
            },
        })
    }

    /// Ingest many texts, one provider call per chunk where possible.
    ///
    /// Rate-limit exhaustion pauses for the announced retry-after and
    /// retries the chunk; any other chunk-level failure degrades to
    /// per-item embedding so one bad item cannot sink its chunk.
    pub async fn add_texts_batch(
        &self,
        user_id: &str,
        items: &[BatchTextItem],
        options: BatchOptions,
    ) -> Result<BatchOutcome> {
        let started = Instant::now();
        let mut outcome = BatchOutcome::default();
        let chunk_size = options.batch_size.max(1);

        for (chunk_index, chunk) in items.chunks(chunk_size).enumerate() {
            let base = chunk_index * chunk_size;
            let texts: Vec<String> = chunk.iter().map(|item| item.text.clone()).collect();

            let mut batch_embeddings = match self.provider.embed_batch(&texts, options.kind).await {
                Ok(vectors) => Some(vectors),
                Err(memvault_embed::Error::RateLimited { retry_after_ms }) => {
                    debug!(retry_after_ms, "Rate limit reached; pausing batch ingestion");
                    tokio::time::sleep(Duration::from_millis(retry_after_ms)).await;
                    self.provider.embed_batch(&texts, options.kind).await.ok()
                }
                Err(e) => {
                    warn!(error = %e, "Batch embedding failed; falling back to per-item calls");
                    None
                }
            };

            for (offset, item) in chunk.iter().enumerate() {
                let embedding = match batch_embeddings.as_mut() {
                    Some(vectors) => Ok(std::mem::take(&mut vectors[offset])),
                    None => self
                        .embed_cached(&item.text, options.kind, false)
                        .await
                        .map(|(v, _)| v)
                        .map_err(|e| e.to_string()),
                };
                match embedding {
                    Ok(embedding) => {
                        let vector_id = self.next_vector_id(user_id).await?;
                        match self
                            .service
                            .add_vector_batched(user_id, vector_id, &embedding, item.metadata.clone())
                            .await
                        {
                            Ok(()) => {
                                outcome.success_count += 1;
                                outcome.results.push(BatchItemOutcome {
                                    index: base + offset,
                                    vector_id: Some(vector_id),
                                    error: None,
                                });
                            }
                            Err(e) => {
                                outcome.failure_count += 1;
                                outcome.results.push(BatchItemOutcome {
                                    index: base + offset,
                                    vector_id: None,
                                    error: Some(e.to_string()),
                                });
                            }
                        }
                    }
                    Err(e) => {
                        outcome.failure_count += 1;
                        outcome.results.push(BatchItemOutcome {
                            index: base + offset,
                            vector_id: None,
                            error: Some(e),
                        });
                    }
                }
            }
        }

        outcome.elapsed = started.elapsed();
        debug!(
            user_id,
            total = items.len(),
            failures = outcome.failure_count,
            "Batch ingestion complete"
        );
        Ok(outcome)
    }

    /// Restore a user's index from a snapshot blob.
    pub async fn load_user_index(&self, blob_id: &BlobId, user_id: &str) -> Result<()> {
        self.service.load_index(blob_id, user_id).await?;
        // re-seed the counter from the restored index
        let next = self.service.next_vector_id(user_id).await?;
        self.counters
            .lock()
            .await
            .insert(user_id.to_string(), next);
        Ok(())
    }

    /// Persist a user's index, returning the snapshot blob id.
    pub async fn save_user_index(&self, user_id: &str) -> Result<BlobId> {
        self.service.save_index(user_id).await
    }

    /// Drain the user's pending buffer.
    pub async fn force_flush_user(&self, user_id: &str) -> Result<()> {
        self.service.force_flush(user_id).await
    }

    /// Drop all of a user's vector state.
    pub async fn clear_user_data(&self, user_id: &str) -> Result<()> {
        self.counters.lock().await.remove(user_id);
        self.service.clear_user_index(user_id).await
    }

    /// Stop background work.
    pub async fn destroy(&self) {
        self.service.destroy().await;
    }
}
