//! Memvault Store — durable persistence primitives.
//!
//! Two storage capabilities live here:
//!
//! - [`BlobStore`]: opaque binary content with a metadata map, addressed
//!   by a prefixed [`BlobId`] (`local_…`, `demo_…`, or a remote-style
//!   content digest). The prefix is part of the contract: the retrieval
//!   layer routes by it.
//! - [`KeyedStore`]: four whole-object JSON namespaces (`indices`,
//!   `vectors`, `graphs`, `memory_mappings`) with point lookups and a
//!   monotonic per-key `version` so last-writer-wins can only move
//!   forward.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod blob;
pub mod error;
pub mod keyed;

pub use blob::{BlobId, BlobLocation, BlobMeta, BlobStore, LocalBlobStore, RemoteBlobStore, RoutedBlobStore};
pub use error::{Error, Result};
pub use keyed::{KeyedRecord, KeyedStore, MemoryKeyedStore, Namespace, SqliteKeyedStore, migrate_payload, SCHEMA_VERSION};
