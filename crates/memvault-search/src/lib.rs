//! Memvault Search — vector indexing and text-level retrieval.
//!
//! The pipeline:
//!
//! ```text
//! text ──► EmbeddingProvider ──► VectorManager ──► HnswIndexService
//!                 │                    │                 │
//!          EmbeddingCache        vector_id counter   pending buffer
//!                                                        │ flush
//!                                                   BlobStore + KeyedStore
//! ```
//!
//! A buffered vector is searchable the instant it is added and durable
//! only after its batch is flushed into a persisted snapshot.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod error;
pub mod index;
pub mod manager;
pub mod service;

pub use cache::{CacheStats, EmbeddingCache};
pub use error::{Error, Result};
pub use index::UserIndex;
pub use manager::{
    AddTextOptions, AddTextOutcome, BatchItemOutcome, BatchOptions, BatchOutcome, BatchTextItem,
    SearchTextOptions, SearchTimings, TextSearchResults, VectorManager, VectorSearchMatch,
};
pub use service::{
    CreatedIndex, FlushReason, HnswIndexService, IndexServiceConfig, MetadataFilter, SearchOptions,
    SearchResults,
};
