//! The engine facade: explicit construction of the full component
//! graph, plus the convenience `remember`/`recall` surface.

use memvault_core::{EngineSettings, Memory};
use memvault_embed::{
    EmbeddingProvider, HashingProvider, HttpProvider, RateLimitedProvider, RetryPolicy, TokenBucket,
};
use memvault_graph::{
    EntityMemories, GraphExtractor, GraphSearchQuery, GraphSearchResult, GraphService, GraphStats,
    GraphStore, GraphUpdateResult, HeuristicExtractor, HttpExtractor, KnowledgeGraphManager,
    ProcessOptions,
};
use memvault_search::{
    AddTextOptions, CacheStats, HnswIndexService, IndexServiceConfig, SearchTextOptions,
    VectorManager, VectorSearchMatch,
};
use memvault_store::{
    BlobId, BlobStore, KeyedStore, LocalBlobStore, RemoteBlobStore, RoutedBlobStore,
    SqliteKeyedStore,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Embedding cache capacity (entries, not user indexes).
const EMBEDDING_CACHE_CAPACITY: usize = 2_048;

/// Engine-level error: whichever subsystem failed.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration error
    #[error(transparent)]
    Config(#[from] memvault_core::ConfigError),

    /// Storage subsystem error
    #[error(transparent)]
    Store(#[from] memvault_store::Error),

    /// Embedding subsystem error
    #[error(transparent)]
    Embed(#[from] memvault_embed::Error),

    /// Vector subsystem error
    #[error(transparent)]
    Search(#[from] memvault_search::Error),

    /// Graph subsystem error
    #[error(transparent)]
    Graph(#[from] memvault_graph::Error),
}

type Result<T> = std::result::Result<T, EngineError>;

/// Outcome of ingesting one memory.
#[derive(Debug)]
pub struct RememberOutcome {
    /// Vector id assigned in the user's index
    pub vector_id: u32,
    /// What the memory contributed to the knowledge graph
    pub graph: GraphUpdateResult,
}

/// Outcome of a recall query.
#[derive(Debug, Default)]
pub struct RecallResult {
    /// Semantic matches from the vector index
    pub matches: Vec<VectorSearchMatch>,
    /// Memory ids connected through the knowledge graph
    pub related_memories: Vec<String>,
}

/// A point-in-time view of per-user engine state.
#[derive(Debug)]
pub struct EngineStats {
    /// Buffered vectors not yet durable
    pub pending_vectors: usize,
    /// Snapshot version of the vector index
    pub index_version: u64,
    /// Embedding cache counters
    pub embedding_cache: CacheStats,
    /// Knowledge-graph statistics
    pub graph: GraphStats,
}

/// The assembled memory engine.
///
/// Construction is an explicit graph: stores, providers and services
/// are built here and handed to each other by constructor argument.
pub struct MemoryEngine {
    settings: EngineSettings,
    vectors: Arc<VectorManager>,
    graph: Arc<KnowledgeGraphManager>,
}

impl MemoryEngine {
    /// Build an engine from settings, creating the on-disk stores (or
    /// in-memory ones when `storage.in_memory` is set).
    pub async fn new(settings: EngineSettings) -> Result<Self> {
        settings.validate()?;

        // ── stores ──────────────────────────────────────────
        let op_timeout = Duration::from_millis(settings.storage.op_timeout_ms);
        let (keyed, local_blobs): (Arc<dyn KeyedStore>, LocalBlobStore) =
            if settings.storage.in_memory {
                (
                    Arc::new(memvault_store::MemoryKeyedStore::new()),
                    LocalBlobStore::in_memory().await?,
                )
            } else {
                let data_dir = settings
                    .storage
                    .data_dir
                    .clone()
                    .unwrap_or_else(memvault_core::default_data_dir);
                (
                    Arc::new(SqliteKeyedStore::from_path(&data_dir.join("store.db")).await?),
                    LocalBlobStore::from_path(&data_dir.join("blobs.db")).await?,
                )
            };
        let local_blobs = if settings.storage.blob_prefix == "demo" {
            local_blobs.with_demo_prefix()
        } else {
            local_blobs
        };
        let local: Arc<dyn BlobStore> = Arc::new(local_blobs);
        let blobs: Arc<dyn BlobStore> = match &settings.storage.remote_url {
            Some(url) => {
                let remote: Arc<dyn BlobStore> =
                    Arc::new(RemoteBlobStore::new(url.clone(), op_timeout)?);
                Arc::new(RoutedBlobStore::new(local, Some(remote)))
            }
            None => Arc::new(RoutedBlobStore::new(local, None)),
        };

        // ── embedding provider ──────────────────────────────
        let base: Arc<dyn EmbeddingProvider> = match settings.embedding.provider.as_str() {
            "http" => {
                let base_url = settings.embedding.base_url.clone().ok_or_else(|| {
                    memvault_embed::Error::NotConfigured(
                        "embedding.base_url is required for the http provider".to_string(),
                    )
                })?;
                Arc::new(HttpProvider::new(
                    base_url,
                    settings.embedding.api_key.clone(),
                    settings.embedding.model.clone(),
                    settings.embedding.dimension,
                    Duration::from_millis(settings.embedding.timeout_ms),
                    RetryPolicy {
                        max_retries: settings.embedding.max_retries,
                        ..RetryPolicy::default()
                    },
                )?)
            }
            _ => Arc::new(HashingProvider::new(settings.embedding.dimension)),
        };
        let bucket = Arc::new(TokenBucket::per_minute(
            settings.embedding.rate_limit_per_minute,
        ));
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(RateLimitedProvider::new(base, bucket));

        // ── graph extractor ─────────────────────────────────
        let extractor: Arc<dyn GraphExtractor> = match settings.graph.extractor.as_str() {
            "http" => {
                let base_url = settings.graph.base_url.clone().ok_or_else(|| {
                    memvault_graph::Error::Extraction(
                        "graph.base_url is required for the http extractor".to_string(),
                    )
                })?;
                Arc::new(HttpExtractor::new(
                    base_url,
                    settings.graph.api_key.clone(),
                    settings.graph.model.clone(),
                    Duration::from_millis(settings.graph.extract_timeout_ms),
                )?)
            }
            _ => Arc::new(HeuristicExtractor::new()),
        };

        // ── services ────────────────────────────────────────
        let index_service = HnswIndexService::new(
            IndexServiceConfig::new(
                settings.index.clone(),
                settings.batch.clone(),
                settings.storage.op_timeout_ms,
            ),
            blobs,
            Arc::clone(&keyed),
        );
        let vectors = Arc::new(VectorManager::new(
            provider,
            index_service,
            EMBEDDING_CACHE_CAPACITY,
        ));
        let graph_service = Arc::new(GraphService::new(extractor, settings.graph.clone()));
        let graph_store = GraphStore::new(keyed, op_timeout);
        let graph = Arc::new(KnowledgeGraphManager::new(graph_service, graph_store));

        info!(
            provider = settings.embedding.provider,
            extractor = settings.graph.extractor,
            dimension = settings.index.dimension,
            "Memory engine assembled"
        );
        Ok(Self {
            settings,
            vectors,
            graph,
        })
    }

    /// Build an engine from pre-assembled components (custom wiring,
    /// tests).
    pub fn with_components(
        settings: EngineSettings,
        vectors: Arc<VectorManager>,
        graph: Arc<KnowledgeGraphManager>,
    ) -> Self {
        Self {
            settings,
            vectors,
            graph,
        }
    }

    /// The vector manager.
    pub fn vectors(&self) -> &Arc<VectorManager> {
        &self.vectors
    }

    /// The knowledge-graph manager.
    pub fn graph(&self) -> &Arc<KnowledgeGraphManager> {
        &self.graph
    }

    /// The settings the engine was built with.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Ingest a memory: index its content and extract it into the
    /// user's knowledge graph.
    pub async fn remember(&self, memory: &Memory) -> Result<RememberOutcome> {
        let mut metadata = json!({
            "memory_id": memory.id,
            "category": memory.category,
            "created_at": memory.created_at.timestamp_millis(),
        });
        if let Some(importance) = memory.importance {
            metadata["importance"] = json!(importance);
        }
        if let Some(topic) = &memory.topic {
            metadata["topic"] = json!(topic);
        }
        if let Some(custom) = &memory.custom_metadata {
            metadata["custom"] = custom.clone();
        }

        let added = self
            .vectors
            .add_text_to_index(
                &memory.user_id,
                &memory.content,
                AddTextOptions {
                    metadata: Some(metadata),
                    ..AddTextOptions::default()
                },
            )
            .await?;
        let graph = self
            .graph
            .process_memory_for_graph(memory, ProcessOptions::default())
            .await?;
        Ok(RememberOutcome {
            vector_id: added.vector_id,
            graph,
        })
    }

    /// Semantic recall plus graph-connected memories.
    pub async fn recall(&self, user_id: &str, query: &str, k: usize) -> Result<RecallResult> {
        let search = self
            .vectors
            .search_similar_texts(
                user_id,
                query,
                SearchTextOptions {
                    k,
                    ..SearchTextOptions::default()
                },
            )
            .await?;

        let keywords: Vec<String> = query
            .split_whitespace()
            .filter(|w| w.chars().count() >= 2)
            .map(str::to_string)
            .collect();
        let related = if keywords.is_empty() {
            Vec::new()
        } else {
            self.graph
                .search_graph(
                    user_id,
                    GraphSearchQuery {
                        keywords: Some(keywords),
                        ..GraphSearchQuery::default()
                    },
                )
                .await?
                .related_memories
        };

        Ok(RecallResult {
            matches: search.matches,
            related_memories: related,
        })
    }

    /// Declarative graph search.
    pub async fn search_graph(
        &self,
        user_id: &str,
        query: GraphSearchQuery,
    ) -> Result<GraphSearchResult> {
        Ok(self.graph.search_graph(user_id, query).await?)
    }

    /// Which memories connect to an entity, and through what.
    pub async fn related_to_entity(
        &self,
        user_id: &str,
        entity_id: &str,
        max_hops: Option<usize>,
    ) -> Result<EntityMemories> {
        Ok(self
            .graph
            .find_memories_related_to_entity(user_id, entity_id, max_hops)
            .await?)
    }

    /// Drain a user's pending vector buffer to durable storage.
    pub async fn force_flush(&self, user_id: &str) -> Result<()> {
        Ok(self.vectors.force_flush_user(user_id).await?)
    }

    /// Persist a user's index, returning the snapshot blob id.
    pub async fn save_user(&self, user_id: &str) -> Result<BlobId> {
        Ok(self.vectors.save_user_index(user_id).await?)
    }

    /// Per-user stats across both subsystems.
    pub async fn stats(&self, user_id: &str) -> Result<EngineStats> {
        let service = self.vectors.index_service();
        Ok(EngineStats {
            pending_vectors: service.pending_len(user_id).await,
            index_version: service.version(user_id).await,
            embedding_cache: self.vectors.cache_stats(),
            graph: self.graph.get_graph_statistics(user_id).await?,
        })
    }

    /// Drop every trace of a user from both subsystems.
    pub async fn forget_user(&self, user_id: &str) -> Result<()> {
        self.vectors.clear_user_data(user_id).await?;
        self.graph.clear_user(user_id).await?;
        Ok(())
    }

    /// Flush all buffers and stop background work.
    pub async fn shutdown(&self) -> Result<()> {
        self.vectors.index_service().flush_all().await?;
        self.vectors.destroy().await;
        info!("Memory engine shut down");
        Ok(())
    }
}
