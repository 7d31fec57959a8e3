//! Memory→graph pipeline and per-user provenance.
//!
//! The manager glues extraction, merging and persistence together:
//! processing a memory is idempotent per `memory_id` (unless forced),
//! per-user writes are serialized through the cached graph's lock, and
//! the in-memory graph stays authoritative when persistence fails.

use crate::error::{Error, Result};
use crate::service::{GraphPath, GraphService, GraphStats, TraversalOptions};
use crate::store::GraphStore;
use crate::types::{
    Entity, EntityType, GraphMemoryMapping, GraphUpdateResult, KnowledgeGraph, Relationship,
};
use chrono::{DateTime, Utc};
use memvault_core::Memory;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Options for [`KnowledgeGraphManager::process_memory_for_graph`].
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Re-run extraction even when a mapping already exists
    pub force_reprocess: bool,
    /// Per-call confidence threshold override
    pub confidence_threshold: Option<f32>,
}

/// Progress callback: `(processed, total)`.
pub type ProgressFn = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Options for batch processing.
pub struct BatchProcessOptions {
    /// Memories per batch
    pub batch_size: usize,
    /// Pause between batches (provider rate budget)
    pub delay_ms: u64,
    /// Optional progress callback
    pub on_progress: Option<ProgressFn>,
}

impl Default for BatchProcessOptions {
    fn default() -> Self {
        Self {
            batch_size: 5,
            delay_ms: 1_000,
            on_progress: None,
        }
    }
}

/// Batch processing outcome.
#[derive(Debug, Default)]
pub struct BatchGraphOutcome {
    /// Per-memory results, input order (skipped memories included)
    pub results: Vec<GraphUpdateResult>,
    /// `(memory_id, error)` for memories that failed to persist
    pub errors: Vec<(String, String)>,
}

/// Declarative graph search across entities, relationships and
/// provenance.
#[derive(Debug, Clone, Default)]
pub struct GraphSearchQuery {
    /// Case-insensitive keywords over labels and properties
    pub keywords: Option<Vec<String>>,
    /// Keep entities of these types
    pub entity_types: Option<Vec<EntityType>>,
    /// Keep relationships with these labels
    pub relationship_types: Option<Vec<String>>,
    /// Keep items derived from any of these memories
    pub memory_ids: Option<Vec<String>>,
    /// Keep items last updated inside this range
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Expand around the entities extracted from this memory
    pub similar_to_memory: Option<String>,
    /// Truncate result lists
    pub max_results: Option<usize>,
}

/// Graph search output.
#[derive(Debug, Clone, Default)]
pub struct GraphSearchResult {
    /// Matching entities
    pub entities: Vec<Entity>,
    /// Matching relationships
    pub relationships: Vec<Relationship>,
    /// Union of the matches' source memories
    pub related_memories: Vec<String>,
    /// Paths from the `similar_to_memory` expansion
    pub paths: Option<Vec<GraphPath>>,
}

/// Memories connected to an entity, with the connecting structure.
#[derive(Debug, Clone, Default)]
pub struct EntityMemories {
    /// Memory ids reachable through the entity's neighbourhood
    pub memories: Vec<String>,
    /// Entities reached by the traversal
    pub connected_entities: Vec<Entity>,
    /// Discovery paths
    pub pathways: Vec<GraphPath>,
}

/// Glues memories to the per-user knowledge graph.
pub struct KnowledgeGraphManager {
    service: Arc<GraphService>,
    store: GraphStore,
    graphs: RwLock<HashMap<String, Arc<Mutex<KnowledgeGraph>>>>,
}

impl KnowledgeGraphManager {
    /// Create a manager over the service and persistence facade.
    pub fn new(service: Arc<GraphService>, store: GraphStore) -> Self {
        Self {
            service,
            store,
            graphs: RwLock::new(HashMap::new()),
        }
    }

    /// The underlying graph service.
    pub fn service(&self) -> &GraphService {
        &self.service
    }

    /// Cached graph handle for a user, loading or creating on miss.
    async fn user_graph(&self, user_id: &str) -> Result<Arc<Mutex<KnowledgeGraph>>> {
        if let Some(graph) = self.graphs.read().await.get(user_id) {
            return Ok(Arc::clone(graph));
        }
        let loaded = self
            .store
            .load_graph(user_id)
            .await?
            .unwrap_or_else(KnowledgeGraph::new);
        let mut graphs = self.graphs.write().await;
        let graph = graphs
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(loaded)));
        Ok(Arc::clone(graph))
    }

    /// A snapshot of the user's graph.
    pub async fn get_user_graph(&self, user_id: &str) -> Result<KnowledgeGraph> {
        let graph = self.user_graph(user_id).await?;
        let guard = graph.lock().await;
        Ok(guard.clone())
    }

    /// Extract a memory into the user's graph.
    ///
    /// A second call for the same `memory_id` with `force_reprocess`
    /// unset is a no-op that reports `skipped`.
    pub async fn process_memory_for_graph(
        &self,
        memory: &Memory,
        options: ProcessOptions,
    ) -> Result<GraphUpdateResult> {
        let user_id = memory.user_id.as_str();
        if !options.force_reprocess {
            if let Some(_existing) = self.store.load_mapping(user_id, &memory.id).await? {
                debug!(user_id, memory_id = %memory.id, "Memory already processed; skipping");
                return Ok(GraphUpdateResult {
                    skipped: true,
                    ..GraphUpdateResult::default()
                });
            }
        }

        let extraction = self
            .service
            .extract_entities_and_relationships(
                &memory.content,
                &memory.id,
                options.confidence_threshold,
            )
            .await;

        let graph = self.user_graph(user_id).await?;
        let mut guard = graph.lock().await;
        let outcome = self.service.add_to_graph(
            &mut guard,
            &extraction.entities,
            &extraction.relationships,
            Some(&memory.id),
        );
        guard.metadata.version += 1;

        // The cached graph stays authoritative if persistence fails;
        // the next successful save carries a higher version anyway.
        self.store.save_graph(user_id, &guard).await?;
        let mapping = GraphMemoryMapping {
            memory_id: memory.id.clone(),
            entity_ids: outcome.entity_ids.clone(),
            relationship_ids: outcome.relationship_ids.clone(),
            extraction_date: Utc::now(),
            confidence: extraction.confidence,
        };
        self.store.save_mapping(user_id, &mapping).await?;

        info!(
            user_id,
            memory_id = %memory.id,
            entities_added = outcome.entities_added,
            relationships_added = outcome.relationships_added,
            "Processed memory into graph"
        );
        Ok(GraphUpdateResult {
            entities_added: outcome.entities_added,
            entities_updated: outcome.entities_updated,
            relationships_added: outcome.relationships_added,
            relationships_updated: outcome.relationships_updated,
            skipped: false,
            extraction,
        })
    }

    /// Process memories in sequential batches, pausing between batches
    /// to respect the extraction provider's rate budget.
    pub async fn process_batch_memories_for_graph(
        &self,
        user_id: &str,
        memories: &[Memory],
        options: BatchProcessOptions,
    ) -> Result<BatchGraphOutcome> {
        let mut outcome = BatchGraphOutcome::default();
        let total = memories.len();
        let mut processed = 0usize;
        let chunk_size = options.batch_size.max(1);

        for (chunk_index, chunk) in memories.chunks(chunk_size).enumerate() {
            if chunk_index > 0 && options.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(options.delay_ms)).await;
            }
            for memory in chunk {
                if memory.user_id != user_id {
                    outcome.errors.push((
                        memory.id.clone(),
                        format!("memory belongs to user {}, not {user_id}", memory.user_id),
                    ));
                    outcome.results.push(GraphUpdateResult::default());
                } else {
                    match self
                        .process_memory_for_graph(memory, ProcessOptions::default())
                        .await
                    {
                        Ok(result) => outcome.results.push(result),
                        Err(e) => {
                            warn!(memory_id = %memory.id, error = %e, "Batch memory processing failed");
                            outcome.errors.push((memory.id.clone(), e.to_string()));
                            outcome.results.push(GraphUpdateResult::default());
                        }
                    }
                }
                processed += 1;
                if let Some(on_progress) = &options.on_progress {
                    on_progress(processed, total);
                }
            }
        }
        Ok(outcome)
    }

    /// Search the graph, collecting the provenance of every match.
    pub async fn search_graph(
        &self,
        user_id: &str,
        query: GraphSearchQuery,
    ) -> Result<GraphSearchResult> {
        let graph = self.user_graph(user_id).await?;
        let guard = graph.lock().await;

        let keywords: Option<Vec<String>> = query
            .keywords
            .as_ref()
            .map(|ks| ks.iter().map(|k| k.to_lowercase()).collect());
        let matches_keywords = |label: &str, properties: Option<&std::collections::BTreeMap<String, serde_json::Value>>| {
            match &keywords {
                None => true,
                Some(ks) => ks.iter().any(|k| {
                    label.to_lowercase().contains(k)
                        || properties
                            .map(|props| {
                                props.values().any(|v| v.to_string().to_lowercase().contains(k))
                            })
                            .unwrap_or(false)
                }),
            }
        };
        let memory_filter: Option<BTreeSet<&str>> = query
            .memory_ids
            .as_ref()
            .map(|ids| ids.iter().map(String::as_str).collect());
        let in_date_range = |ts: DateTime<Utc>| {
            query
                .date_range
                .map(|(from, to)| ts >= from && ts <= to)
                .unwrap_or(true)
        };

        let mut entities: Vec<Entity> = guard
            .entities
            .iter()
            .filter(|e| {
                query
                    .entity_types
                    .as_ref()
                    .map(|types| types.contains(&e.entity_type))
                    .unwrap_or(true)
            })
            .filter(|e| matches_keywords(&e.label, Some(&e.properties)))
            .filter(|e| {
                memory_filter
                    .as_ref()
                    .map(|ids| e.source_memory_ids.iter().any(|m| ids.contains(m.as_str())))
                    .unwrap_or(true)
            })
            .filter(|e| in_date_range(e.last_updated))
            .cloned()
            .collect();

        let rel_types: Option<BTreeSet<String>> = query
            .relationship_types
            .as_ref()
            .map(|types| types.iter().map(|t| t.to_lowercase()).collect());
        let mut relationships: Vec<Relationship> = guard
            .relationships
            .iter()
            .filter(|r| {
                rel_types
                    .as_ref()
                    .map(|set| set.contains(&r.label.to_lowercase()))
                    .unwrap_or(true)
            })
            .filter(|r| matches_keywords(&r.label, None))
            .filter(|r| {
                memory_filter
                    .as_ref()
                    .map(|ids| r.source_memory_ids.iter().any(|m| ids.contains(m.as_str())))
                    .unwrap_or(true)
            })
            .filter(|r| in_date_range(r.last_updated))
            .cloned()
            .collect();

        // expansion around a reference memory's entities
        let mut paths = None;
        if let Some(memory_id) = &query.similar_to_memory {
            if let Some(mapping) = self.store.load_mapping(user_id, memory_id).await? {
                let related = self
                    .service
                    .find_related_entities(
                        &guard,
                        &mapping.entity_ids,
                        TraversalOptions {
                            max_hops: self.service.settings().max_hops,
                            relationship_types: None,
                            include_paths: true,
                        },
                    )
                    .await;
                for entity in related.entities {
                    if !entities.iter().any(|e| e.id == entity.id) {
                        entities.push(entity);
                    }
                }
                for rel in related.relationships {
                    if !relationships.iter().any(|r| r.id == rel.id) {
                        relationships.push(rel);
                    }
                }
                paths = related.paths;
            }
        }

        if let Some(limit) = query.max_results {
            entities.truncate(limit);
            relationships.truncate(limit);
        }

        let mut related_memories: BTreeSet<String> = BTreeSet::new();
        for entity in &entities {
            related_memories.extend(entity.source_memory_ids.iter().cloned());
        }
        for rel in &relationships {
            related_memories.extend(rel.source_memory_ids.iter().cloned());
        }

        Ok(GraphSearchResult {
            entities,
            relationships,
            related_memories: related_memories.into_iter().collect(),
            paths,
        })
    }

    /// Which memories are connected to an entity, through which
    /// neighbours.
    pub async fn find_memories_related_to_entity(
        &self,
        user_id: &str,
        entity_id: &str,
        max_hops: Option<usize>,
    ) -> Result<EntityMemories> {
        let graph = self.user_graph(user_id).await?;
        let guard = graph.lock().await;
        let seed = guard
            .entity(entity_id)
            .ok_or_else(|| Error::NotFound(format!("entity {entity_id} for user {user_id}")))?
            .clone();

        let related = self
            .service
            .find_related_entities(
                &guard,
                &[entity_id.to_string()],
                TraversalOptions {
                    max_hops: max_hops.unwrap_or(self.service.settings().max_hops),
                    relationship_types: None,
                    include_paths: true,
                },
            )
            .await;

        let mut memories: BTreeSet<String> = seed.source_memory_ids.iter().cloned().collect();
        for entity in &related.entities {
            memories.extend(entity.source_memory_ids.iter().cloned());
        }
        for rel in &related.relationships {
            memories.extend(rel.source_memory_ids.iter().cloned());
        }

        Ok(EntityMemories {
            memories: memories.into_iter().collect(),
            connected_entities: related.entities,
            pathways: related.paths.unwrap_or_default(),
        })
    }

    /// Aggregate statistics for a user's graph.
    pub async fn get_graph_statistics(&self, user_id: &str) -> Result<GraphStats> {
        let graph = self.user_graph(user_id).await?;
        let guard = graph.lock().await;
        Ok(self.service.get_graph_stats(&guard))
    }

    /// Drop a user's graph from cache and persistence.
    pub async fn clear_user(&self, user_id: &str) -> Result<()> {
        self.graphs.write().await.remove(user_id);
        self.store.delete_user(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::HeuristicExtractor;
    use memvault_core::config::GraphSettings;
    use memvault_store::MemoryKeyedStore;

    fn manager() -> KnowledgeGraphManager {
        let service = Arc::new(GraphService::new(
            Arc::new(HeuristicExtractor::new()),
            GraphSettings::default(),
        ));
        let store = GraphStore::new(Arc::new(MemoryKeyedStore::new()), Duration::from_secs(5));
        KnowledgeGraphManager::new(service, store)
    }

    fn memory(id: &str, user: &str, content: &str) -> Memory {
        let mut m = Memory::new(user, content);
        m.id = id.to_string();
        m
    }

    #[tokio::test]
    async fn test_process_memory_builds_graph() {
        let mgr = manager();
        let mem = memory("m1", "u1", "Alice works at Acme in Paris.");
        let result = mgr
            .process_memory_for_graph(&mem, ProcessOptions::default())
            .await
            .unwrap();

        assert!(!result.skipped);
        assert!(result.entities_added >= 3);
        assert!(result.relationships_added >= 2);

        let graph = mgr.get_user_graph("u1").await.unwrap();
        assert!(graph.has_entity("alice"));
        assert!(graph.has_entity("acme"));
        assert!(graph.has_entity("paris"));
        assert_eq!(graph.metadata.version, 1);
    }

    #[tokio::test]
    async fn test_reprocessing_is_idempotent() {
        let mgr = manager();
        let mem = memory("m1", "u1", "Alice works at Acme in Paris.");
        mgr.process_memory_for_graph(&mem, ProcessOptions::default())
            .await
            .unwrap();
        let before = mgr.get_user_graph("u1").await.unwrap();

        let second = mgr
            .process_memory_for_graph(&mem, ProcessOptions::default())
            .await
            .unwrap();
        assert!(second.skipped);
        assert_eq!(second.entities_added, 0);

        let after = mgr.get_user_graph("u1").await.unwrap();
        assert_eq!(after.entities.len(), before.entities.len());
        assert_eq!(after.relationships.len(), before.relationships.len());
        assert_eq!(after.metadata.version, before.metadata.version);
    }

    #[tokio::test]
    async fn test_force_reprocess_runs_again() {
        let mgr = manager();
        let mem = memory("m1", "u1", "Alice works at Acme.");
        mgr.process_memory_for_graph(&mem, ProcessOptions::default())
            .await
            .unwrap();
        let result = mgr
            .process_memory_for_graph(
                &mem,
                ProcessOptions {
                    force_reprocess: true,
                    ..ProcessOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(!result.skipped);
        assert!(result.entities_updated >= 2);
        // graph contents unchanged up to timestamps
        let graph = mgr.get_user_graph("u1").await.unwrap();
        assert_eq!(graph.entities.len(), 2);
    }

    #[tokio::test]
    async fn test_fuzzy_merge_across_memories() {
        let mgr = manager();
        mgr.process_memory_for_graph(
            &memory("m1", "u1", "Alice works at Acme in Paris."),
            ProcessOptions::default(),
        )
        .await
        .unwrap();
        mgr.process_memory_for_graph(
            &memory("m2", "u1", "Alicia works at ACME."),
            ProcessOptions::default(),
        )
        .await
        .unwrap();

        let graph = mgr.get_user_graph("u1").await.unwrap();
        // alicia merged into alice; no new person entity
        assert!(graph.has_entity("alice"));
        assert!(!graph.has_entity("alicia"));
        let alice = graph.entity("alice").unwrap();
        assert!(alice.source_memory_ids.contains("m1"));
        assert!(alice.source_memory_ids.contains("m2"));
    }

    #[tokio::test]
    async fn test_find_memories_related_to_entity() {
        let mgr = manager();
        mgr.process_memory_for_graph(
            &memory("m1", "u1", "Alice works at Acme in Paris."),
            ProcessOptions::default(),
        )
        .await
        .unwrap();
        mgr.process_memory_for_graph(
            &memory("m2", "u1", "Alicia works at ACME."),
            ProcessOptions::default(),
        )
        .await
        .unwrap();

        let result = mgr
            .find_memories_related_to_entity("u1", "paris", Some(2))
            .await
            .unwrap();
        assert!(result.memories.contains(&"m1".to_string()));
        assert!(result.memories.contains(&"m2".to_string()));
        // the path to alice goes through acme
        let through_acme = result
            .pathways
            .iter()
            .any(|p| p.entity_ids.contains(&"acme".to_string()));
        assert!(through_acme);
    }

    #[tokio::test]
    async fn test_unknown_entity_errors() {
        let mgr = manager();
        mgr.process_memory_for_graph(
            &memory("m1", "u1", "Alice works at Acme."),
            ProcessOptions::default(),
        )
        .await
        .unwrap();
        let err = mgr.find_memories_related_to_entity("u1", "ghost", None).await;
        assert!(matches!(err, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_search_graph_by_keyword() {
        let mgr = manager();
        mgr.process_memory_for_graph(
            &memory("m1", "u1", "Alice works at Acme in Paris."),
            ProcessOptions::default(),
        )
        .await
        .unwrap();

        let result = mgr
            .search_graph(
                "u1",
                GraphSearchQuery {
                    keywords: Some(vec!["acme".to_string()]),
                    ..GraphSearchQuery::default()
                },
            )
            .await
            .unwrap();
        assert!(result.entities.iter().any(|e| e.id == "acme"));
        assert!(result.related_memories.contains(&"m1".to_string()));
    }

    #[tokio::test]
    async fn test_search_graph_similar_to_memory() {
        let mgr = manager();
        mgr.process_memory_for_graph(
            &memory("m1", "u1", "Alice works at Acme in Paris."),
            ProcessOptions::default(),
        )
        .await
        .unwrap();
        mgr.process_memory_for_graph(
            &memory("m2", "u1", "Bob works at Acme."),
            ProcessOptions::default(),
        )
        .await
        .unwrap();

        let result = mgr
            .search_graph(
                "u1",
                GraphSearchQuery {
                    similar_to_memory: Some("m2".to_string()),
                    ..GraphSearchQuery::default()
                },
            )
            .await
            .unwrap();
        assert!(result.paths.is_some());
        assert!(result.related_memories.contains(&"m1".to_string()));
    }

    #[tokio::test]
    async fn test_batch_processing_with_progress() {
        let mgr = manager();
        let memories: Vec<Memory> = (0..7)
            .map(|i| memory(&format!("m{i}"), "u1", "Alice works at Acme."))
            .collect();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let outcome = mgr
            .process_batch_memories_for_graph(
                "u1",
                &memories,
                BatchProcessOptions {
                    batch_size: 3,
                    delay_ms: 0,
                    on_progress: Some(Box::new(move |done, total| {
                        seen_clone.lock().unwrap().push((done, total));
                    })),
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 7);
        assert!(outcome.errors.is_empty());
        let progress = seen.lock().unwrap();
        assert_eq!(progress.len(), 7);
        assert_eq!(*progress.last().unwrap(), (7, 7));
    }

    #[tokio::test]
    async fn test_batch_rejects_foreign_memories() {
        let mgr = manager();
        let memories = vec![memory("m1", "intruder", "Alice works at Acme.")];
        let outcome = mgr
            .process_batch_memories_for_graph("u1", &memories, BatchProcessOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_graph_survives_manager_restart() {
        let keyed = Arc::new(MemoryKeyedStore::new());
        let store = GraphStore::new(keyed.clone() as Arc<dyn memvault_store::KeyedStore>, Duration::from_secs(5));
        let service = Arc::new(GraphService::new(
            Arc::new(HeuristicExtractor::new()),
            GraphSettings::default(),
        ));
        let mgr = KnowledgeGraphManager::new(Arc::clone(&service), store.clone());
        mgr.process_memory_for_graph(
            &memory("m1", "u1", "Alice works at Acme in Paris."),
            ProcessOptions::default(),
        )
        .await
        .unwrap();

        let mgr2 = KnowledgeGraphManager::new(service, store);
        let graph = mgr2.get_user_graph("u1").await.unwrap();
        assert!(graph.has_entity("alice"));
        assert_eq!(graph.metadata.version, 1);
        // and the idempotence survives the restart
        let result = mgr2
            .process_memory_for_graph(
                &memory("m1", "u1", "Alice works at Acme in Paris."),
                ProcessOptions::default(),
            )
            .await
            .unwrap();
        assert!(result.skipped);
    }

    #[tokio::test]
    async fn test_clear_user() {
        let mgr = manager();
        mgr.process_memory_for_graph(
            &memory("m1", "u1", "Alice works at Acme."),
            ProcessOptions::default(),
        )
        .await
        .unwrap();
        mgr.clear_user("u1").await.unwrap();
        let graph = mgr.get_user_graph("u1").await.unwrap();
        assert!(graph.entities.is_empty());
    }
}
