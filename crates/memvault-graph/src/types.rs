//! Core data types for the knowledge graph.
//!
//! The graph connects **entities** (people, organizations, locations,
//! concepts) through labeled **relationships**, both carrying the ids
//! of the memories they were derived from. Timestamps are persisted as
//! milliseconds since epoch so the on-disk encoding is canonical.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Classification of an extracted entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// A person
    Person,
    /// A company, team, institution
    Organization,
    /// A place
    Location,
    /// A dated occurrence
    Event,
    /// An abstract concept or keyword
    Concept,
    /// Anything else
    Other,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Person => write!(f, "person"),
            Self::Organization => write!(f, "organization"),
            Self::Location => write!(f, "location"),
            Self::Event => write!(f, "event"),
            Self::Concept => write!(f, "concept"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl EntityType {
    /// Parse from string.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "person" => Self::Person,
            "organization" | "org" | "company" => Self::Organization,
            "location" | "place" => Self::Location,
            "event" => Self::Event,
            "concept" => Self::Concept,
            _ => Self::Other,
        }
    }
}

/// Canonical entity id: lowercase label with non-word runs collapsed
/// to a single underscore.
pub fn sanitize_id(label: &str) -> String {
    let mut id = String::with_capacity(label.len());
    for c in label.trim().chars() {
        if c.is_alphanumeric() {
            for lower in c.to_lowercase() {
                id.push(lower);
            }
        } else if !id.ends_with('_') {
            id.push('_');
        }
    }
    id.trim_matches('_').to_string()
}

/// Canonical relationship id from its unique `(source, target, label)`
/// triple.
pub fn relationship_id(source: &str, target: &str, label: &str) -> String {
    format!("{source}__{}__{target}", sanitize_id(label))
}

/// An entity in the knowledge graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Canonical id (sanitized label)
    pub id: String,
    /// Display label as first extracted
    pub label: String,
    /// Entity classification
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    /// Extraction confidence (0.0–1.0)
    pub confidence: f32,
    /// Free-form properties gathered across extractions
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Memories this entity was derived from
    pub source_memory_ids: BTreeSet<String>,
    /// When this entity was first created
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// When this entity was last merged into
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
}

impl Entity {
    /// Create a fresh entity from a label.
    pub fn new(label: impl Into<String>, entity_type: EntityType, confidence: f32) -> Self {
        let label = label.into();
        let now = Utc::now();
        Self {
            id: sanitize_id(&label),
            label,
            entity_type,
            confidence,
            properties: BTreeMap::new(),
            source_memory_ids: BTreeSet::new(),
            created_at: now,
            last_updated: now,
        }
    }
}

/// A directed labeled relationship between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    /// Canonical id derived from `(source, target, label)`
    pub id: String,
    /// Source entity id
    pub source: String,
    /// Target entity id
    pub target: String,
    /// Relationship label (e.g. `"works at"`)
    pub label: String,
    /// Optional relationship class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_type: Option<String>,
    /// Extraction confidence (0.0–1.0)
    pub confidence: f32,
    /// Memories this relationship was derived from
    pub source_memory_ids: BTreeSet<String>,
    /// When this relationship was first created
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// When this relationship was last merged into
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
}

impl Relationship {
    /// Create a fresh relationship between two entity ids.
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        label: impl Into<String>,
        confidence: f32,
    ) -> Self {
        let source = source.into();
        let target = target.into();
        let label = label.into();
        let now = Utc::now();
        Self {
            id: relationship_id(&source, &target, &label),
            source,
            target,
            label,
            rel_type: None,
            confidence,
            source_memory_ids: BTreeSet::new(),
            created_at: now,
            last_updated: now,
        }
    }
}

/// Graph-level bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphMetadata {
    /// Persistence version; strictly increases per save
    pub version: u64,
    /// When the graph was created
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// When the graph was last updated
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
    /// Entity count (kept in sync by the merge)
    pub total_entities: usize,
    /// Relationship count (kept in sync by the merge)
    pub total_relationships: usize,
    /// Every memory that contributed to this graph
    pub source_memories: BTreeSet<String>,
}

impl Default for GraphMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: 0,
            created_at: now,
            last_updated: now,
            total_entities: 0,
            total_relationships: 0,
            source_memories: BTreeSet::new(),
        }
    }
}

/// A per-user knowledge graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    /// All entities, sorted by id when persisted
    pub entities: Vec<Entity>,
    /// All relationships, sorted by id when persisted
    pub relationships: Vec<Relationship>,
    /// Graph bookkeeping
    pub metadata: GraphMetadata,
}

impl KnowledgeGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an entity by id.
    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    /// Look up an entity mutably.
    pub fn entity_mut(&mut self, id: &str) -> Option<&mut Entity> {
        self.entities.iter_mut().find(|e| e.id == id)
    }

    /// Whether an entity id exists.
    pub fn has_entity(&self, id: &str) -> bool {
        self.entities.iter().any(|e| e.id == id)
    }

    /// Look up a relationship by id.
    pub fn relationship(&self, id: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.id == id)
    }

    /// Sort entities and relationships by id (the canonical persisted
    /// order) and refresh the totals.
    pub fn canonicalize(&mut self) {
        self.entities.sort_by(|a, b| a.id.cmp(&b.id));
        self.relationships.sort_by(|a, b| a.id.cmp(&b.id));
        self.metadata.total_entities = self.entities.len();
        self.metadata.total_relationships = self.relationships.len();
    }

    /// Check that every relationship endpoint resolves and every
    /// entity's provenance is covered by the graph's source set.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for rel in &self.relationships {
            if !self.has_entity(&rel.source) {
                return Err(format!(
                    "relationship {} has dangling source {}",
                    rel.id, rel.source
                ));
            }
            if !self.has_entity(&rel.target) {
                return Err(format!(
                    "relationship {} has dangling target {}",
                    rel.id, rel.target
                ));
            }
        }
        for entity in &self.entities {
            for mem in &entity.source_memory_ids {
                if !self.metadata.source_memories.contains(mem) {
                    return Err(format!(
                        "entity {} references memory {mem} missing from graph source set",
                        entity.id
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Raw extraction output, before merging into a graph.
#[derive(Debug, Clone, Default)]
pub struct GraphExtractionResult {
    /// Extracted entities
    pub entities: Vec<ExtractedEntity>,
    /// Extracted relationships (endpoints are labels, not ids)
    pub relationships: Vec<ExtractedRelationship>,
    /// Overall extraction confidence
    pub confidence: f32,
}

impl GraphExtractionResult {
    /// The degraded result used when extraction fails.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// An extracted entity candidate.
#[derive(Debug, Clone)]
pub struct ExtractedEntity {
    /// Label as it appeared in the text
    pub label: String,
    /// Classification
    pub entity_type: EntityType,
    /// Confidence (0.0–1.0)
    pub confidence: f32,
    /// Properties gathered by the extractor
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// An extracted relationship candidate; endpoints reference entity
/// labels from the same extraction.
#[derive(Debug, Clone)]
pub struct ExtractedRelationship {
    /// Source entity label
    pub source: String,
    /// Target entity label
    pub target: String,
    /// Relationship label
    pub label: String,
    /// Optional relationship class
    pub rel_type: Option<String>,
    /// Confidence (0.0–1.0)
    pub confidence: f32,
}

/// Provenance row linking a memory to what it contributed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphMemoryMapping {
    /// The memory
    pub memory_id: String,
    /// Entities this memory created or touched
    pub entity_ids: Vec<String>,
    /// Relationships this memory created or touched
    pub relationship_ids: Vec<String>,
    /// When extraction ran
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub extraction_date: DateTime<Utc>,
    /// Extraction confidence
    pub confidence: f32,
}

/// Outcome of processing one memory into the graph.
#[derive(Debug, Clone, Default)]
pub struct GraphUpdateResult {
    /// Entities inserted
    pub entities_added: usize,
    /// Entities merged into
    pub entities_updated: usize,
    /// Relationships inserted
    pub relationships_added: usize,
    /// Relationships merged into
    pub relationships_updated: usize,
    /// True when the memory was already processed and nothing ran
    pub skipped: bool,
    /// The extraction that fed the update
    pub extraction: GraphExtractionResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("Alice"), "alice");
        assert_eq!(sanitize_id("New York City"), "new_york_city");
        assert_eq!(sanitize_id("  ACME, Inc.  "), "acme_inc");
        assert_eq!(sanitize_id("a--b"), "a_b");
        assert_eq!(sanitize_id("!!!"), "");
    }

    #[test]
    fn test_relationship_id_is_triple_keyed() {
        let a = relationship_id("alice", "acme", "works at");
        let b = relationship_id("alice", "acme", "works at");
        let c = relationship_id("alice", "acme", "founded");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, "alice__works_at__acme");
    }

    #[test]
    fn test_entity_type_roundtrip() {
        for t in [
            EntityType::Person,
            EntityType::Organization,
            EntityType::Location,
            EntityType::Event,
            EntityType::Concept,
            EntityType::Other,
        ] {
            assert_eq!(EntityType::from_str_lossy(&t.to_string()), t);
        }
        assert_eq!(EntityType::from_str_lossy("widget"), EntityType::Other);
    }

    #[test]
    fn test_timestamps_persist_as_millis() {
        let entity = Entity::new("Alice", EntityType::Person, 0.9);
        let json = serde_json::to_value(&entity).unwrap();
        assert!(json["created_at"].is_i64());
    }

    #[test]
    fn test_graph_validate_dangling_endpoint() {
        let mut graph = KnowledgeGraph::new();
        graph.entities.push(Entity::new("Alice", EntityType::Person, 0.9));
        graph
            .relationships
            .push(Relationship::new("alice", "acme", "works at", 0.8));
        assert!(graph.validate().is_err());

        graph
            .entities
            .push(Entity::new("Acme", EntityType::Organization, 0.9));
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_graph_validate_source_memory_coverage() {
        let mut graph = KnowledgeGraph::new();
        let mut alice = Entity::new("Alice", EntityType::Person, 0.9);
        alice.source_memory_ids.insert("m1".to_string());
        graph.entities.push(alice);
        assert!(graph.validate().is_err());

        graph.metadata.source_memories.insert("m1".to_string());
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_canonicalize_sorts_by_id() {
        let mut graph = KnowledgeGraph::new();
        graph.entities.push(Entity::new("Zed", EntityType::Person, 0.9));
        graph.entities.push(Entity::new("Alice", EntityType::Person, 0.9));
        graph.canonicalize();
        assert_eq!(graph.entities[0].id, "alice");
        assert_eq!(graph.metadata.total_entities, 2);
    }

    #[test]
    fn test_graph_serialization_roundtrip() {
        let mut graph = KnowledgeGraph::new();
        graph.entities.push(Entity::new("Alice", EntityType::Person, 0.9));
        graph.canonicalize();
        let json = serde_json::to_string(&graph).unwrap();
        let back: KnowledgeGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entities.len(), 1);
        assert_eq!(back.entities[0].entity_type, EntityType::Person);
    }
}
