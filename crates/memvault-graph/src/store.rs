//! Graph and provenance persistence through the keyed store.
//!
//! Graphs are whole-object rows in the `graphs` namespace, one per
//! user, persisted in canonical form (entities and relationships sorted
//! by id, timestamps as epoch millis). Mappings live in
//! `memory_mappings` under `user:memory_id`.

use crate::error::{Error, Result};
use crate::types::{GraphMemoryMapping, KnowledgeGraph};
use memvault_store::{migrate_payload, KeyedStore, Namespace, SCHEMA_VERSION};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Persistence facade for graphs and memory mappings.
#[derive(Clone)]
pub struct GraphStore {
    keyed: Arc<dyn KeyedStore>,
    op_timeout: Duration,
}

impl GraphStore {
    /// Create a store over the keyed backend.
    pub fn new(keyed: Arc<dyn KeyedStore>, op_timeout: Duration) -> Self {
        Self { keyed, op_timeout }
    }

    fn mapping_key(user_id: &str, memory_id: &str) -> String {
        format!("{user_id}:{memory_id}")
    }

    async fn io<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, memvault_store::Error>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout(self.op_timeout.as_millis() as u64)),
        }
    }

    /// Persist a graph. The write is rejected locally if the graph
    /// violates its own invariants.
    pub async fn save_graph(&self, user_id: &str, graph: &KnowledgeGraph) -> Result<()> {
        let mut canonical = graph.clone();
        canonical.canonicalize();
        canonical.validate().map_err(Error::Integrity)?;

        let payload = json!({
            "schema_version": SCHEMA_VERSION,
            "entities": canonical.entities,
            "relationships": canonical.relationships,
            "metadata": canonical.metadata,
        });
        self.io(self.keyed.put(
            Namespace::Graphs,
            user_id,
            payload,
            canonical.metadata.version,
        ))
        .await?;
        debug!(
            user_id,
            entities = canonical.entities.len(),
            relationships = canonical.relationships.len(),
            version = canonical.metadata.version,
            "Persisted graph"
        );
        Ok(())
    }

    /// Load a user's graph, if one was persisted.
    pub async fn load_graph(&self, user_id: &str) -> Result<Option<KnowledgeGraph>> {
        let record = self.io(self.keyed.get(Namespace::Graphs, user_id)).await?;
        let Some(record) = record else {
            return Ok(None);
        };
        let payload = migrate_payload(record.payload)?;
        let graph = KnowledgeGraph {
            entities: serde_json::from_value(payload["entities"].clone())?,
            relationships: serde_json::from_value(payload["relationships"].clone())?,
            metadata: serde_json::from_value(payload["metadata"].clone())?,
        };
        Ok(Some(graph))
    }

    /// Persist a memory→graph mapping.
    pub async fn save_mapping(&self, user_id: &str, mapping: &GraphMemoryMapping) -> Result<()> {
        let mut payload = serde_json::to_value(mapping)?;
        payload["schema_version"] = json!(SCHEMA_VERSION);
        // newer extraction wins on force_reprocess
        let version = mapping.extraction_date.timestamp_millis().max(0) as u64;
        self.io(self.keyed.put(
            Namespace::MemoryMappings,
            &Self::mapping_key(user_id, &mapping.memory_id),
            payload,
            version,
        ))
        .await
    }

    /// Load the mapping for one memory, if it was processed.
    pub async fn load_mapping(
        &self,
        user_id: &str,
        memory_id: &str,
    ) -> Result<Option<GraphMemoryMapping>> {
        let record = self
            .io(
                self.keyed
                    .get(Namespace::MemoryMappings, &Self::mapping_key(user_id, memory_id)),
            )
            .await?;
        match record {
            Some(record) => {
                let payload = migrate_payload(record.payload)?;
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    /// All mappings for a user.
    pub async fn list_mappings(&self, user_id: &str) -> Result<Vec<GraphMemoryMapping>> {
        let keys = self
            .io(
                self.keyed
                    .list_keys(Namespace::MemoryMappings, &format!("{user_id}:")),
            )
            .await?;
        let mut mappings = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.io(self.keyed.get(Namespace::MemoryMappings, &key)).await? {
                let payload = migrate_payload(record.payload)?;
                mappings.push(serde_json::from_value(payload)?);
            }
        }
        Ok(mappings)
    }

    /// Drop a user's graph and every mapping.
    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.io(self.keyed.delete(Namespace::Graphs, user_id)).await?;
        let keys = self
            .io(
                self.keyed
                    .list_keys(Namespace::MemoryMappings, &format!("{user_id}:")),
            )
            .await?;
        for key in keys {
            self.io(self.keyed.delete(Namespace::MemoryMappings, &key)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Entity, EntityType, Relationship};
    use chrono::Utc;
    use memvault_store::MemoryKeyedStore;

    fn store() -> GraphStore {
        GraphStore::new(Arc::new(MemoryKeyedStore::new()), Duration::from_secs(5))
    }

    fn sample_graph() -> KnowledgeGraph {
        let mut graph = KnowledgeGraph::new();
        let mut alice = Entity::new("Alice", EntityType::Person, 0.9);
        alice.source_memory_ids.insert("m1".to_string());
        let mut acme = Entity::new("Acme", EntityType::Organization, 0.9);
        acme.source_memory_ids.insert("m1".to_string());
        graph.entities.push(acme);
        graph.entities.push(alice);
        let mut rel = Relationship::new("alice", "acme", "works at", 0.85);
        rel.source_memory_ids.insert("m1".to_string());
        graph.relationships.push(rel);
        graph.metadata.source_memories.insert("m1".to_string());
        graph.metadata.version = 1;
        graph
    }

    #[tokio::test]
    async fn test_graph_roundtrip() {
        let store = store();
        let graph = sample_graph();
        store.save_graph("u1", &graph).await.unwrap();

        let loaded = store.load_graph("u1").await.unwrap().unwrap();
        assert_eq!(loaded.entities.len(), 2);
        assert_eq!(loaded.relationships.len(), 1);
        assert_eq!(loaded.metadata.version, 1);
        // canonical order: sorted by id
        assert_eq!(loaded.entities[0].id, "acme");
        assert_eq!(loaded.entities[1].id, "alice");
    }

    #[tokio::test]
    async fn test_missing_graph_is_none() {
        let store = store();
        assert!(store.load_graph("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_graph_rejected() {
        let store = store();
        let mut graph = KnowledgeGraph::new();
        graph
            .relationships
            .push(Relationship::new("ghost", "acme", "haunts", 0.5));
        let err = store.save_graph("u1", &graph).await;
        assert!(matches!(err, Err(Error::Integrity(_))));
    }

    #[tokio::test]
    async fn test_mapping_roundtrip_and_listing() {
        let store = store();
        for memory_id in ["m1", "m2"] {
            let mapping = GraphMemoryMapping {
                memory_id: memory_id.to_string(),
                entity_ids: vec!["alice".to_string()],
                relationship_ids: vec![],
                extraction_date: Utc::now(),
                confidence: 0.9,
            };
            store.save_mapping("u1", &mapping).await.unwrap();
        }

        let loaded = store.load_mapping("u1", "m1").await.unwrap().unwrap();
        assert_eq!(loaded.entity_ids, vec!["alice"]);
        assert!(store.load_mapping("u1", "m3").await.unwrap().is_none());
        assert!(store.load_mapping("u2", "m1").await.unwrap().is_none());

        let all = store.list_mappings("u1").await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_user_drops_everything() {
        let store = store();
        store.save_graph("u1", &sample_graph()).await.unwrap();
        let mapping = GraphMemoryMapping {
            memory_id: "m1".to_string(),
            entity_ids: vec![],
            relationship_ids: vec![],
            extraction_date: Utc::now(),
            confidence: 0.5,
        };
        store.save_mapping("u1", &mapping).await.unwrap();

        store.delete_user("u1").await.unwrap();
        assert!(store.load_graph("u1").await.unwrap().is_none());
        assert!(store.list_mappings("u1").await.unwrap().is_empty());
    }
}
