//! Layered engine configuration.
//!
//! Settings come from three layers, later ones winning: built-in
//! defaults, an optional TOML file, and `MEMVAULT__`-prefixed
//! environment variables (e.g. `MEMVAULT__INDEX__DIMENSION=384`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying loader error
    #[error("config error: {0}")]
    Load(#[from] config::ConfigError),

    /// A setting failed cross-field validation
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Vector space used by the HNSW index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpaceKind {
    /// Cosine distance (default, best for text embeddings)
    #[default]
    Cosine,
    /// Squared Euclidean distance
    L2,
}

impl std::fmt::Display for SpaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cosine => write!(f, "cosine"),
            Self::L2 => write!(f, "l2"),
        }
    }
}

impl SpaceKind {
    /// Parse from string, defaulting to cosine.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "l2" => Self::L2,
            _ => Self::Cosine,
        }
    }
}

/// Embedding provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// Provider selector: `hashing` (deterministic, offline) or `http`
    pub provider: String,
    /// Model name reported by the provider
    pub model: String,
    /// Vector length; must match `index.dimension`
    pub dimension: usize,
    /// Token-bucket capacity per minute
    pub rate_limit_per_minute: u32,
    /// Base URL for the `http` provider
    pub base_url: Option<String>,
    /// API key for the `http` provider
    pub api_key: Option<String>,
    /// Per-call deadline in milliseconds
    pub timeout_ms: u64,
    /// Maximum retries for transient provider errors
    pub max_retries: u32,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            model: "memvault-hash-768".to_string(),
            dimension: 768,
            rate_limit_per_minute: 60,
            base_url: None,
            api_key: None,
            timeout_ms: 10_000,
            max_retries: 3,
        }
    }
}

/// HNSW index tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Vector length
    pub dimension: usize,
    /// Initial index capacity
    pub max_elements: usize,
    /// HNSW construction expansion factor
    pub ef_construction: usize,
    /// HNSW connectivity
    pub m: usize,
    /// Default search expansion factor
    pub ef_search: usize,
    /// Accepted for parity with the original configuration surface;
    /// the usearch backend does not expose graph seeding
    pub random_seed: u64,
    /// Distance space
    pub space: SpaceKind,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            dimension: 768,
            max_elements: 10_000,
            ef_construction: 200,
            m: 16,
            ef_search: 50,
            random_seed: 42,
            space: SpaceKind::Cosine,
        }
    }
}

/// Buffering and cache-eviction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Pending-buffer size that triggers an immediate flush
    pub max_batch_size: usize,
    /// Flush tick period and max pending age, in milliseconds
    pub batch_delay_ms: u64,
    /// Idle time before a user's in-memory index entry is evicted
    pub cache_ttl_ms: u64,
    /// Maximum number of user entries held in memory
    pub max_cache_size: usize,
    /// Also persist raw vectors into the `vectors` namespace on flush
    pub persist_raw_vectors: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            batch_delay_ms: 5_000,
            cache_ttl_ms: 30 * 60 * 1_000,
            max_cache_size: 100,
            persist_raw_vectors: false,
        }
    }
}

impl BatchSettings {
    /// Flush tick period / max pending age.
    pub fn batch_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.batch_delay_ms)
    }

    /// Idle eviction TTL.
    pub fn cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Knowledge-graph settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphSettings {
    /// Extractor selector: `heuristic` (deterministic, offline) or `http`
    pub extractor: String,
    /// Model name for the `http` extractor
    pub model: String,
    /// Drop extractions below this confidence
    pub confidence_threshold: f32,
    /// Fuzzy-merge cutoff for entity deduplication
    pub deduplication_threshold: f32,
    /// BFS depth limit for traversal queries
    pub max_hops: usize,
    /// Memories per batch in batch processing
    pub batch_size: usize,
    /// Delay between batches, in milliseconds
    pub batch_delay_ms: u64,
    /// Per-call deadline for extraction, in milliseconds
    pub extract_timeout_ms: u64,
    /// Base URL for the `http` extractor
    pub base_url: Option<String>,
    /// API key for the `http` extractor
    pub api_key: Option<String>,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            extractor: "heuristic".to_string(),
            model: "default".to_string(),
            confidence_threshold: 0.7,
            deduplication_threshold: 0.85,
            max_hops: 3,
            batch_size: 5,
            batch_delay_ms: 1_000,
            extract_timeout_ms: 15_000,
            base_url: None,
            api_key: None,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Data directory for the SQLite stores; `None` uses the platform default
    pub data_dir: Option<PathBuf>,
    /// Keep everything in memory (tests, ephemeral sessions)
    pub in_memory: bool,
    /// Blob id prefix for the local store: `local` or `demo`
    pub blob_prefix: String,
    /// Base URL of the remote content-addressed blob service, if any
    pub remote_url: Option<String>,
    /// Per-call deadline for storage I/O, in milliseconds
    pub op_timeout_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            in_memory: false,
            blob_prefix: "local".to_string(),
            remote_url: None,
            op_timeout_ms: 10_000,
        }
    }
}

/// Root engine settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Embedding provider settings
    pub embedding: EmbeddingSettings,
    /// HNSW index settings
    pub index: IndexSettings,
    /// Buffering settings
    pub batch: BatchSettings,
    /// Knowledge-graph settings
    pub graph: GraphSettings,
    /// Persistence settings
    pub storage: StorageSettings,
}

impl EngineSettings {
    /// Load settings from defaults, an optional TOML file, and the
    /// `MEMVAULT__` environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings: Self = builder
            .add_source(
                config::Environment::with_prefix("MEMVAULT")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Cross-field validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding.dimension != self.index.dimension {
            return Err(ConfigError::Invalid(format!(
                "embedding.dimension ({}) must match index.dimension ({})",
                self.embedding.dimension, self.index.dimension
            )));
        }
        if self.batch.max_batch_size == 0 {
            return Err(ConfigError::Invalid("batch.max_batch_size must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.graph.confidence_threshold) {
            return Err(ConfigError::Invalid(
                "graph.confidence_threshold must be in [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.graph.deduplication_threshold) {
            return Err(ConfigError::Invalid(
                "graph.deduplication_threshold must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}
