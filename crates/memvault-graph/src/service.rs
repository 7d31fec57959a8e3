//! Graph derivation and maintenance.
//!
//! The merge is deterministic: id matches merge in place, unmatched
//! entities fall back to a fuzzy pass against the whole graph, and
//! relationships are unique per `(source, target, label)` triple.
//! Traversal yields to the runtime periodically so a large BFS never
//! starves other tasks.

use crate::extractor::GraphExtractor;
use crate::similarity;
use crate::types::{
    relationship_id, sanitize_id, Entity, EntityType, ExtractedEntity, ExtractedRelationship,
    GraphExtractionResult, KnowledgeGraph, Relationship,
};
use chrono::Utc;
use memvault_core::config::GraphSettings;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// BFS nodes expanded between cooperative yields.
const TRAVERSAL_YIELD_EVERY: usize = 128;

/// Deltas produced by one merge.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Entities inserted
    pub entities_added: usize,
    /// Entities merged into
    pub entities_updated: usize,
    /// Relationships inserted
    pub relationships_added: usize,
    /// Relationships merged into
    pub relationships_updated: usize,
    /// Every entity id this merge created or touched
    pub entity_ids: Vec<String>,
    /// Every relationship id this merge created or touched
    pub relationship_ids: Vec<String>,
}

/// Options for [`GraphService::find_related_entities`].
#[derive(Debug, Clone)]
pub struct TraversalOptions {
    /// BFS depth limit
    pub max_hops: usize,
    /// Only traverse relationships whose label (or class) is listed
    pub relationship_types: Option<Vec<String>>,
    /// Also return the discovery path per reached entity
    pub include_paths: bool,
}

impl Default for TraversalOptions {
    fn default() -> Self {
        Self {
            max_hops: 3,
            relationship_types: None,
            include_paths: false,
        }
    }
}

/// A discovery path from a seed to a reached entity. The score is the
/// product of edge confidences along the path.
#[derive(Debug, Clone)]
pub struct GraphPath {
    /// Entity ids from seed to target, in order
    pub entity_ids: Vec<String>,
    /// Relationship ids traversed, in order
    pub relationship_ids: Vec<String>,
    /// Product of edge confidences
    pub score: f32,
}

/// Traversal output.
#[derive(Debug, Clone, Default)]
pub struct RelatedEntities {
    /// Reached entities (seeds excluded)
    pub entities: Vec<Entity>,
    /// Relationships traversed
    pub relationships: Vec<Relationship>,
    /// Discovery paths, when requested
    pub paths: Option<Vec<GraphPath>>,
    /// Number of reached entities
    pub total_results: usize,
}

/// Declarative graph filter.
#[derive(Debug, Clone, Default)]
pub struct GraphQuery {
    /// Keep entities of these types
    pub entity_types: Option<Vec<EntityType>>,
    /// Keep relationships with these labels (or classes)
    pub relationship_types: Option<Vec<String>>,
    /// Case-insensitive match over labels and property values
    pub search_text: Option<String>,
    /// Truncate both result lists
    pub limit: Option<usize>,
}

/// Query output.
#[derive(Debug, Clone, Default)]
pub struct GraphQueryResult {
    /// Matching entities
    pub entities: Vec<Entity>,
    /// Matching relationships
    pub relationships: Vec<Relationship>,
}

/// Aggregate graph statistics.
#[derive(Debug, Clone, Default)]
pub struct GraphStats {
    /// Entity count
    pub total_entities: usize,
    /// Relationship count
    pub total_relationships: usize,
    /// Entities per type
    pub entities_by_type: HashMap<String, usize>,
    /// Relationships per label
    pub relationships_by_label: HashMap<String, usize>,
    /// Mean entity confidence
    pub average_entity_confidence: f32,
    /// Memories that contributed to the graph
    pub source_memory_count: usize,
    /// Top entities by degree, `(id, degree)`
    pub most_connected: Vec<(String, usize)>,
}

/// Derives and maintains per-user knowledge graphs.
pub struct GraphService {
    extractor: Arc<dyn GraphExtractor>,
    settings: GraphSettings,
    extraction_failures: AtomicU64,
}

impl GraphService {
    /// Create a service around the given extractor.
    pub fn new(extractor: Arc<dyn GraphExtractor>, settings: GraphSettings) -> Self {
        Self {
            extractor,
            settings,
            extraction_failures: AtomicU64::new(0),
        }
    }

    /// The configured settings.
    pub fn settings(&self) -> &GraphSettings {
        &self.settings
    }

    /// Extraction failures recorded since startup.
    pub fn extraction_failures(&self) -> u64 {
        self.extraction_failures.load(Ordering::Relaxed)
    }

    /// Run the extractor and drop low-confidence output.
    ///
    /// Extraction failure never fails the caller: it degrades to an
    /// empty result with confidence 0 and a recorded failure.
    pub async fn extract_entities_and_relationships(
        &self,
        content: &str,
        memory_id: &str,
        confidence_threshold: Option<f32>,
    ) -> GraphExtractionResult {
        let threshold = confidence_threshold.unwrap_or(self.settings.confidence_threshold);
        let timeout = Duration::from_millis(self.settings.extract_timeout_ms.max(1));

        let extracted = match tokio::time::timeout(
            timeout,
            self.extractor.extract(content, memory_id),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(memory_id, error = %e, "Extraction failed; using empty result");
                self.extraction_failures.fetch_add(1, Ordering::Relaxed);
                return GraphExtractionResult::empty();
            }
            Err(_) => {
                warn!(memory_id, timeout_ms = timeout.as_millis() as u64, "Extraction timed out; using empty result");
                self.extraction_failures.fetch_add(1, Ordering::Relaxed);
                return GraphExtractionResult::empty();
            }
        };

        let mut result = extracted;
        result.entities.retain(|e| e.confidence >= threshold);
        let kept: HashSet<String> = result
            .entities
            .iter()
            .map(|e| sanitize_id(&e.label))
            .collect();
        result.relationships.retain(|r| {
            r.confidence >= threshold
                && kept.contains(&sanitize_id(&r.source))
                && kept.contains(&sanitize_id(&r.target))
        });
        result
    }

    /// Merge extracted entities and relationships into the graph.
    pub fn add_to_graph(
        &self,
        graph: &mut KnowledgeGraph,
        entities: &[ExtractedEntity],
        relationships: &[ExtractedRelationship],
        memory_id: Option<&str>,
    ) -> MergeOutcome {
        let now = Utc::now();
        let mut outcome = MergeOutcome::default();
        // incoming sanitized label → final id in the graph
        let mut resolution: HashMap<String, String> = HashMap::new();

        for incoming in entities {
            let incoming_id = sanitize_id(&incoming.label);
            if incoming_id.is_empty() {
                continue;
            }

            // exact id match
            let target_id = if graph.has_entity(&incoming_id) {
                Some(incoming_id.clone())
            } else {
                // fuzzy pass against the whole graph
                let mut best: Option<(f32, String)> = None;
                for existing in &graph.entities {
                    let score = similarity::entity_similarity(
                        &incoming.label,
                        incoming.entity_type,
                        &existing.label,
                        existing.entity_type,
                    );
                    if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                        best = Some((score, existing.id.clone()));
                    }
                }
                match best {
                    Some((score, id)) if score >= self.settings.deduplication_threshold => {
                        debug!(incoming = %incoming.label, merged_into = %id, score, "Fuzzy-merged entity");
                        Some(id)
                    }
                    _ => None,
                }
            };

            match target_id {
                Some(id) => {
                    if let Some(entity) = graph.entity_mut(&id) {
                        entity.confidence = entity.confidence.max(incoming.confidence);
                        for (key, value) in &incoming.properties {
                            entity.properties.entry(key.clone()).or_insert_with(|| value.clone());
                        }
                        if let Some(mem) = memory_id {
                            entity.source_memory_ids.insert(mem.to_string());
                        }
                        entity.last_updated = now;
                    }
                    outcome.entities_updated += 1;
                    outcome.entity_ids.push(id.clone());
                    resolution.insert(incoming_id, id);
                }
                None => {
                    let mut entity =
                        Entity::new(incoming.label.clone(), incoming.entity_type, incoming.confidence);
                    entity.properties = incoming.properties.clone();
                    if let Some(mem) = memory_id {
                        entity.source_memory_ids.insert(mem.to_string());
                    }
                    entity.created_at = now;
                    entity.last_updated = now;
                    outcome.entities_added += 1;
                    outcome.entity_ids.push(entity.id.clone());
                    resolution.insert(incoming_id, entity.id.clone());
                    graph.entities.push(entity);
                }
            }
        }

        for incoming in relationships {
            let source_key = sanitize_id(&incoming.source);
            let target_key = sanitize_id(&incoming.target);
            let source = resolution.get(&source_key).cloned().unwrap_or(source_key);
            let target = resolution.get(&target_key).cloned().unwrap_or(target_key);
            // insert only when both endpoints exist
            if !graph.has_entity(&source) || !graph.has_entity(&target) {
                continue;
            }

            let rel_id = relationship_id(&source, &target, &incoming.label);
            if let Some(existing) = graph.relationships.iter_mut().find(|r| r.id == rel_id) {
                existing.confidence = existing.confidence.max(incoming.confidence);
                if let Some(mem) = memory_id {
                    existing.source_memory_ids.insert(mem.to_string());
                }
                existing.last_updated = now;
                outcome.relationships_updated += 1;
                outcome.relationship_ids.push(rel_id);
            } else {
                let mut rel = Relationship::new(source, target, incoming.label.clone(), incoming.confidence);
                rel.rel_type = incoming.rel_type.clone();
                if let Some(mem) = memory_id {
                    rel.source_memory_ids.insert(mem.to_string());
                }
                rel.created_at = now;
                rel.last_updated = now;
                outcome.relationships_added += 1;
                outcome.relationship_ids.push(rel.id.clone());
                graph.relationships.push(rel);
            }
        }

        if let Some(mem) = memory_id {
            graph.metadata.source_memories.insert(mem.to_string());
        }
        graph.metadata.last_updated = now;
        graph.metadata.total_entities = graph.entities.len();
        graph.metadata.total_relationships = graph.relationships.len();
        outcome
    }

    /// BFS from the seed set, up to `max_hops` away.
    pub async fn find_related_entities(
        &self,
        graph: &KnowledgeGraph,
        seed_ids: &[String],
        options: TraversalOptions,
    ) -> RelatedEntities {
        let allowed = options.relationship_types.as_ref().map(|types| {
            types
                .iter()
                .map(|t| t.to_lowercase())
                .collect::<HashSet<String>>()
        });
        let rel_allowed = |rel: &Relationship| match &allowed {
            None => true,
            Some(set) => {
                set.contains(&rel.label.to_lowercase())
                    || rel
                        .rel_type
                        .as_ref()
                        .map(|t| set.contains(&t.to_lowercase()))
                        .unwrap_or(false)
            }
        };

        // adjacency over both edge directions
        let mut adjacency: HashMap<&str, Vec<&Relationship>> = HashMap::new();
        for rel in &graph.relationships {
            if !rel_allowed(rel) {
                continue;
            }
            adjacency.entry(rel.source.as_str()).or_default().push(rel);
            adjacency.entry(rel.target.as_str()).or_default().push(rel);
        }

        let seeds: HashSet<&str> = seed_ids
            .iter()
            .map(String::as_str)
            .filter(|id| graph.has_entity(id))
            .collect();

        struct Visit {
            hops: usize,
            path_entities: Vec<String>,
            path_relationships: Vec<String>,
            score: f32,
        }

        let mut visited: HashMap<String, Visit> = HashMap::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        for seed in &seeds {
            visited.insert(
                (*seed).to_string(),
                Visit {
                    hops: 0,
                    path_entities: vec![(*seed).to_string()],
                    path_relationships: Vec::new(),
                    score: 1.0,
                },
            );
            queue.push_back((*seed).to_string());
        }

        let mut traversed: BTreeSet<String> = BTreeSet::new();
        let mut expanded = 0usize;
        while let Some(current) = queue.pop_front() {
            expanded += 1;
            if expanded % TRAVERSAL_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
            let (hops, path_entities, path_relationships, score) = {
                let v = &visited[&current];
                (v.hops, v.path_entities.clone(), v.path_relationships.clone(), v.score)
            };
            if hops >= options.max_hops {
                continue;
            }
            let Some(edges) = adjacency.get(current.as_str()) else {
                continue;
            };
            for rel in edges {
                let neighbour = if rel.source == current {
                    rel.target.as_str()
                } else {
                    rel.source.as_str()
                };
                traversed.insert(rel.id.clone());
                if visited.contains_key(neighbour) {
                    continue;
                }
                let mut entities = path_entities.clone();
                entities.push(neighbour.to_string());
                let mut rels = path_relationships.clone();
                rels.push(rel.id.clone());
                visited.insert(
                    neighbour.to_string(),
                    Visit {
                        hops: hops + 1,
                        path_entities: entities,
                        path_relationships: rels,
                        score: score * rel.confidence,
                    },
                );
                queue.push_back(neighbour.to_string());
            }
        }

        let mut entities: Vec<Entity> = visited
            .keys()
            .filter(|id| !seeds.contains(id.as_str()))
            .filter_map(|id| graph.entity(id).cloned())
            .collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));

        let relationships: Vec<Relationship> = graph
            .relationships
            .iter()
            .filter(|r| traversed.contains(&r.id))
            .cloned()
            .collect();

        let paths = options.include_paths.then(|| {
            let mut paths: Vec<GraphPath> = visited
                .iter()
                .filter(|(id, _)| !seeds.contains(id.as_str()))
                .map(|(_, v)| GraphPath {
                    entity_ids: v.path_entities.clone(),
                    relationship_ids: v.path_relationships.clone(),
                    score: v.score,
                })
                .collect();
            paths.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            paths
        });

        let total_results = entities.len();
        RelatedEntities {
            entities,
            relationships,
            paths,
            total_results,
        }
    }

    /// Declarative filter over the graph.
    pub fn query_graph(&self, graph: &KnowledgeGraph, query: &GraphQuery) -> GraphQueryResult {
        let search = query.search_text.as_ref().map(|s| s.to_lowercase());
        let matches_text = |label: &str, properties: Option<&std::collections::BTreeMap<String, serde_json::Value>>| {
            match &search {
                None => true,
                Some(needle) => {
                    if label.to_lowercase().contains(needle) {
                        return true;
                    }
                    properties
                        .map(|props| {
                            props
                                .values()
                                .any(|v| v.to_string().to_lowercase().contains(needle))
                        })
                        .unwrap_or(false)
                }
            }
        };

        let mut entities: Vec<Entity> = graph
            .entities
            .iter()
            .filter(|e| {
                query
                    .entity_types
                    .as_ref()
                    .map(|types| types.contains(&e.entity_type))
                    .unwrap_or(true)
            })
            .filter(|e| matches_text(&e.label, Some(&e.properties)))
            .cloned()
            .collect();

        let rel_types: Option<HashSet<String>> = query
            .relationship_types
            .as_ref()
            .map(|types| types.iter().map(|t| t.to_lowercase()).collect());
        let mut relationships: Vec<Relationship> = graph
            .relationships
            .iter()
            .filter(|r| {
                rel_types
                    .as_ref()
                    .map(|set| {
                        set.contains(&r.label.to_lowercase())
                            || r.rel_type
                                .as_ref()
                                .map(|t| set.contains(&t.to_lowercase()))
                                .unwrap_or(false)
                    })
                    .unwrap_or(true)
            })
            .filter(|r| matches_text(&r.label, None))
            .cloned()
            .collect();

        if let Some(limit) = query.limit {
            entities.truncate(limit);
            relationships.truncate(limit);
        }
        GraphQueryResult {
            entities,
            relationships,
        }
    }

    /// Aggregate statistics.
    pub fn get_graph_stats(&self, graph: &KnowledgeGraph) -> GraphStats {
        let mut entities_by_type: HashMap<String, usize> = HashMap::new();
        for entity in &graph.entities {
            *entities_by_type.entry(entity.entity_type.to_string()).or_default() += 1;
        }
        let mut relationships_by_label: HashMap<String, usize> = HashMap::new();
        let mut degree: HashMap<&str, usize> = HashMap::new();
        for rel in &graph.relationships {
            *relationships_by_label.entry(rel.label.clone()).or_default() += 1;
            *degree.entry(rel.source.as_str()).or_default() += 1;
            *degree.entry(rel.target.as_str()).or_default() += 1;
        }
        let mut most_connected: Vec<(String, usize)> = degree
            .into_iter()
            .map(|(id, d)| (id.to_string(), d))
            .collect();
        most_connected.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        most_connected.truncate(5);

        let average_entity_confidence = if graph.entities.is_empty() {
            0.0
        } else {
            graph.entities.iter().map(|e| e.confidence).sum::<f32>() / graph.entities.len() as f32
        };

        GraphStats {
            total_entities: graph.entities.len(),
            total_relationships: graph.relationships.len(),
            entities_by_type,
            relationships_by_label,
            average_entity_confidence,
            source_memory_count: graph.metadata.source_memories.len(),
            most_connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::HeuristicExtractor;

    fn service() -> GraphService {
        GraphService::new(Arc::new(HeuristicExtractor::new()), GraphSettings::default())
    }

    fn extracted_entity(label: &str, entity_type: EntityType, confidence: f32) -> ExtractedEntity {
        ExtractedEntity {
            label: label.to_string(),
            entity_type,
            confidence,
            properties: Default::default(),
        }
    }

    fn extracted_rel(source: &str, target: &str, label: &str) -> ExtractedRelationship {
        ExtractedRelationship {
            source: source.to_string(),
            target: target.to_string(),
            label: label.to_string(),
            rel_type: None,
            confidence: 0.85,
        }
    }

    fn alice_acme_paris(svc: &GraphService, graph: &mut KnowledgeGraph, memory_id: &str) {
        let entities = vec![
            extracted_entity("Alice", EntityType::Person, 0.9),
            extracted_entity("Acme", EntityType::Organization, 0.9),
            extracted_entity("Paris", EntityType::Location, 0.85),
        ];
        let rels = vec![
            extracted_rel("Alice", "Acme", "works at"),
            extracted_rel("Acme", "Paris", "located in"),
        ];
        svc.add_to_graph(graph, &entities, &rels, Some(memory_id));
    }

    #[tokio::test]
    async fn test_extract_filters_low_confidence() {
        let svc = service();
        // "Momentum" appears mid-sentence and scores 0.6, below 0.7
        let result = svc
            .extract_entities_and_relationships(
                "Alice works at Acme. We discussed Momentum today.",
                "m1",
                None,
            )
            .await;
        assert!(result.entities.iter().all(|e| e.confidence >= 0.7));
        assert!(!result
            .entities
            .iter()
            .any(|e| sanitize_id(&e.label) == "momentum"));
    }

    #[test]
    fn test_merge_inserts_and_counts() {
        let svc = service();
        let mut graph = KnowledgeGraph::new();
        alice_acme_paris(&svc, &mut graph, "m1");

        assert_eq!(graph.entities.len(), 3);
        assert_eq!(graph.relationships.len(), 2);
        assert!(graph.validate().is_ok());
        assert!(graph.metadata.source_memories.contains("m1"));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let svc = service();
        let mut graph = KnowledgeGraph::new();
        alice_acme_paris(&svc, &mut graph, "m1");
        let before_entities = graph.entities.len();
        let before_rels = graph.relationships.len();

        alice_acme_paris(&svc, &mut graph, "m1");
        assert_eq!(graph.entities.len(), before_entities);
        assert_eq!(graph.relationships.len(), before_rels);
    }

    #[test]
    fn test_repeated_entity_add_is_stable() {
        let svc = service();
        let mut graph = KnowledgeGraph::new();
        let e = vec![extracted_entity("Alice", EntityType::Person, 0.9)];
        let o1 = svc.add_to_graph(&mut graph, &e, &[], None);
        assert_eq!(o1.entities_added, 1);
        let o2 = svc.add_to_graph(&mut graph, &e, &[], None);
        assert_eq!(o2.entities_added, 0);
        assert_eq!(o2.entities_updated, 1);
        assert_eq!(graph.entities.len(), 1);
    }

    #[test]
    fn test_fuzzy_merge_name_variant() {
        let svc = service();
        let mut graph = KnowledgeGraph::new();
        alice_acme_paris(&svc, &mut graph, "m1");

        let entities = vec![
            extracted_entity("Alicia", EntityType::Person, 0.9),
            extracted_entity("ACME", EntityType::Organization, 0.9),
        ];
        let rels = vec![extracted_rel("Alicia", "ACME", "works at")];
        let outcome = svc.add_to_graph(&mut graph, &entities, &rels, Some("m2"));

        // both merged into existing entities, nothing new
        assert_eq!(outcome.entities_added, 0);
        assert_eq!(outcome.entities_updated, 2);
        assert_eq!(graph.entities.len(), 3);

        let alice = graph.entity("alice").unwrap();
        assert!(alice.source_memory_ids.contains("m1"));
        assert!(alice.source_memory_ids.contains("m2"));

        // the relationship resolved onto the merged entities
        assert_eq!(outcome.relationships_updated, 1);
        assert_eq!(graph.relationships.len(), 2);
    }

    #[test]
    fn test_relationship_needs_both_endpoints() {
        let svc = service();
        let mut graph = KnowledgeGraph::new();
        let entities = vec![extracted_entity("Alice", EntityType::Person, 0.9)];
        let rels = vec![extracted_rel("Alice", "Ghost", "knows")];
        let outcome = svc.add_to_graph(&mut graph, &entities, &rels, None);
        assert_eq!(outcome.relationships_added, 0);
        assert!(graph.relationships.is_empty());
    }

    #[test]
    fn test_duplicate_relationship_takes_max_confidence() {
        let svc = service();
        let mut graph = KnowledgeGraph::new();
        let entities = vec![
            extracted_entity("Alice", EntityType::Person, 0.9),
            extracted_entity("Acme", EntityType::Organization, 0.9),
        ];
        let mut rel = extracted_rel("Alice", "Acme", "works at");
        rel.confidence = 0.6;
        svc.add_to_graph(&mut graph, &entities, &[rel.clone()], Some("m1"));
        rel.confidence = 0.95;
        svc.add_to_graph(&mut graph, &entities, &[rel], Some("m2"));

        let stored = &graph.relationships[0];
        assert!((stored.confidence - 0.95).abs() < 1e-6);
        assert!(stored.source_memory_ids.contains("m1"));
        assert!(stored.source_memory_ids.contains("m2"));
    }

    #[tokio::test]
    async fn test_traversal_two_hops_with_product_score() {
        let svc = service();
        let mut graph = KnowledgeGraph::new();
        alice_acme_paris(&svc, &mut graph, "m1");

        let related = svc
            .find_related_entities(
                &graph,
                &["paris".to_string()],
                TraversalOptions {
                    max_hops: 2,
                    relationship_types: None,
                    include_paths: true,
                },
            )
            .await;

        let ids: Vec<&str> = related.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["acme", "alice"]);

        let paths = related.paths.unwrap();
        let alice_path = paths
            .iter()
            .find(|p| p.entity_ids.last().map(String::as_str) == Some("alice"))
            .unwrap();
        assert_eq!(alice_path.entity_ids, vec!["paris", "acme", "alice"]);
        // product of the two 0.85 edges
        assert!((alice_path.score - 0.85 * 0.85).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_traversal_respects_hop_limit() {
        let svc = service();
        let mut graph = KnowledgeGraph::new();
        alice_acme_paris(&svc, &mut graph, "m1");

        let related = svc
            .find_related_entities(
                &graph,
                &["paris".to_string()],
                TraversalOptions {
                    max_hops: 1,
                    ..TraversalOptions::default()
                },
            )
            .await;
        let ids: Vec<&str> = related.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["acme"]);
    }

    #[tokio::test]
    async fn test_traversal_relationship_type_filter() {
        let svc = service();
        let mut graph = KnowledgeGraph::new();
        alice_acme_paris(&svc, &mut graph, "m1");

        let related = svc
            .find_related_entities(
                &graph,
                &["paris".to_string()],
                TraversalOptions {
                    max_hops: 3,
                    relationship_types: Some(vec!["located in".to_string()]),
                    include_paths: false,
                },
            )
            .await;
        let ids: Vec<&str> = related.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["acme"]); // "works at" edges were filtered out
    }

    #[tokio::test]
    async fn test_traversal_unknown_seed() {
        let svc = service();
        let graph = KnowledgeGraph::new();
        let related = svc
            .find_related_entities(&graph, &["ghost".to_string()], TraversalOptions::default())
            .await;
        assert_eq!(related.total_results, 0);
    }

    #[test]
    fn test_query_by_type_and_text() {
        let svc = service();
        let mut graph = KnowledgeGraph::new();
        alice_acme_paris(&svc, &mut graph, "m1");

        let result = svc.query_graph(
            &graph,
            &GraphQuery {
                entity_types: Some(vec![EntityType::Person]),
                ..GraphQuery::default()
            },
        );
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].id, "alice");

        let result = svc.query_graph(
            &graph,
            &GraphQuery {
                search_text: Some("ACM".to_string()),
                ..GraphQuery::default()
            },
        );
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].id, "acme");
    }

    #[test]
    fn test_query_searches_properties() {
        let svc = service();
        let mut graph = KnowledgeGraph::new();
        let mut alice = extracted_entity("Alice", EntityType::Person, 0.9);
        alice
            .properties
            .insert("role".to_string(), serde_json::Value::String("engineer".to_string()));
        svc.add_to_graph(&mut graph, &[alice], &[], None);

        let result = svc.query_graph(
            &graph,
            &GraphQuery {
                search_text: Some("engineer".to_string()),
                ..GraphQuery::default()
            },
        );
        assert_eq!(result.entities.len(), 1);
    }

    #[test]
    fn test_stats() {
        let svc = service();
        let mut graph = KnowledgeGraph::new();
        alice_acme_paris(&svc, &mut graph, "m1");

        let stats = svc.get_graph_stats(&graph);
        assert_eq!(stats.total_entities, 3);
        assert_eq!(stats.total_relationships, 2);
        assert_eq!(stats.entities_by_type["person"], 1);
        assert_eq!(stats.relationships_by_label["works at"], 1);
        assert_eq!(stats.source_memory_count, 1);
        assert_eq!(stats.most_connected[0], ("acme".to_string(), 2));
    }
}
