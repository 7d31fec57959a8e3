//! Memvault — a personal, client-side memory engine.
//!
//! Short text memories go in; semantic search and a knowledge graph
//! come out, both persisted on-device so retrieval works without a
//! server.
//!
//! ```text
//!                  ┌────────────── MemoryEngine ──────────────┐
//! Memory ──► VectorManager ──► HnswIndexService ──► BlobStore │
//!     │                                              KeyedStore
//!     └────► KnowledgeGraphManager ──► GraphService ─────┘
//! ```
//!
//! The engine wires every component by constructor argument — no
//! service container, no globals. See [`MemoryEngine`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod engine;

pub use engine::{EngineError, EngineStats, MemoryEngine, RecallResult, RememberOutcome};

pub use memvault_core::{default_data_dir, EngineSettings, Memory};
pub use memvault_embed::{EmbeddingKind, EmbeddingProvider, HashingProvider, HttpProvider};
pub use memvault_graph::{
    EntityMemories, GraphSearchQuery, GraphSearchResult, KnowledgeGraph, KnowledgeGraphManager,
};
pub use memvault_search::{
    SearchTextOptions, TextSearchResults, VectorManager, VectorSearchMatch,
};
pub use memvault_store::{BlobId, BlobStore, KeyedStore};
