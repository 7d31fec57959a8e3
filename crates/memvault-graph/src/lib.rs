//! Memvault Graph — per-user knowledge graphs derived from memories.
//!
//! # Architecture
//!
//! ```text
//! Memory ──► GraphExtractor ──► entities + relationships
//!                                      │
//!                              GraphService (fuzzy merge)
//!                                      │
//!                              KnowledgeGraph (per user)
//!                             ╱                ╲
//!                   GraphStore (persist)   BFS traversal
//!                             ╲                ╱
//!                        KnowledgeGraphManager
//! ```
//!
//! Entities are deduplicated with a weighted label-similarity score;
//! every entity and relationship carries the ids of the memories it was
//! derived from, so "which memories mention X" is a lookup, not a scan.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod extractor;
pub mod manager;
pub mod service;
pub mod similarity;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use extractor::{GraphExtractor, HeuristicExtractor, HttpExtractor};
pub use manager::{
    BatchGraphOutcome, BatchProcessOptions, EntityMemories, GraphSearchQuery, GraphSearchResult,
    KnowledgeGraphManager, ProcessOptions,
};
pub use service::{
    GraphPath, GraphQuery, GraphQueryResult, GraphService, GraphStats, MergeOutcome,
    RelatedEntities, TraversalOptions,
};
pub use store::GraphStore;
pub use types::{
    sanitize_id, Entity, EntityType, ExtractedEntity, ExtractedRelationship,
    GraphExtractionResult, GraphMemoryMapping, GraphMetadata, GraphUpdateResult, KnowledgeGraph,
    Relationship,
};
