//! Entity and relationship extraction from memory text.
//!
//! Two variants behind one trait, selected at construction time:
//! [`HeuristicExtractor`] is deterministic regex + keyword extraction
//! with no model calls and always exists as the fallback;
//! [`HttpExtractor`] asks an LLM endpoint for a JSON extraction.

use crate::error::{Error, Result};
use crate::types::{
    sanitize_id, EntityType, ExtractedEntity, ExtractedRelationship, GraphExtractionResult,
};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

/// Derives graph structure from memory text.
#[async_trait]
pub trait GraphExtractor: Send + Sync {
    /// Extract entities and relationships from `content`.
    async fn extract(&self, content: &str, memory_id: &str) -> Result<GraphExtractionResult>;

    /// Extractor name.
    fn name(&self) -> &str;
}

// ── Compiled patterns ───────────────────────────────────────────

/// Capitalized name sequence ("Alice", "New York", "ACME").
const NAME: &str = r"[A-Z][\w&'\-]*(?:\s+[A-Z][\w&'\-]*)*";

static RE_WORKS_AT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?P<person>{NAME})\s+works\s+(?:at|for)\s+(?P<org>{NAME})"
    ))
    .unwrap()
});

static RE_ORG_IN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"works\s+(?:at|for)\s+(?P<org>{NAME})\s+in\s+(?P<loc>{NAME})"
    ))
    .unwrap()
});

static RE_FOUNDED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?P<person>{NAME})\s+founded\s+(?P<org>{NAME})")).unwrap()
});

static RE_LIVES_IN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?P<person>{NAME})\s+(?:lives|lived|resides)\s+in\s+(?P<loc>{NAME})"
    ))
    .unwrap()
});

static RE_WENT_TO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?P<person>{NAME})\s+(?P<verb>visited|moved\s+to|went\s+to|traveled\s+to)\s+(?P<loc>{NAME})"
    ))
    .unwrap()
});

static RE_IS_A: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?P<subj>{NAME})\s+is\s+(?:a|an|the)\s+(?P<pred>[a-z][a-z\- ]{{1,40}}?)(?:[.,;!?]|$)"
    ))
    .unwrap()
});

static RE_IN_PLACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\bin\s+(?P<loc>{NAME})")).unwrap());

static RE_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(NAME).unwrap());

/// Pronouns and determiners that look like names at sentence starts.
static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "i", "the", "a", "an", "my", "his", "her", "our", "their", "he", "she", "it", "they",
        "we", "you", "this", "that", "these", "those", "today", "yesterday", "tomorrow", "mr",
        "mrs", "ms", "dr",
    ]
    .into_iter()
    .collect()
});

// ── Heuristic extractor ─────────────────────────────────────────

/// Rule-based extraction — no model calls, fully deterministic.
#[derive(Debug, Default)]
pub struct HeuristicExtractor;

impl HeuristicExtractor {
    /// Create the extractor.
    pub fn new() -> Self {
        Self
    }

    fn push_entity(
        entities: &mut Vec<ExtractedEntity>,
        seen: &mut HashSet<String>,
        label: &str,
        entity_type: EntityType,
        confidence: f32,
    ) {
        let id = sanitize_id(label);
        if id.is_empty() || STOP_WORDS.contains(id.as_str()) {
            return;
        }
        if seen.insert(id) {
            entities.push(ExtractedEntity {
                label: label.to_string(),
                entity_type,
                confidence,
                properties: BTreeMap::new(),
            });
        }
    }

    fn push_relationship(
        relationships: &mut Vec<ExtractedRelationship>,
        seen: &mut HashSet<String>,
        source: &str,
        target: &str,
        label: &str,
        confidence: f32,
    ) {
        let key = format!("{}|{}|{}", sanitize_id(source), sanitize_id(target), sanitize_id(label));
        if seen.insert(key) {
            relationships.push(ExtractedRelationship {
                source: source.to_string(),
                target: target.to_string(),
                label: label.to_string(),
                rel_type: None,
                confidence,
            });
        }
    }

    fn run(content: &str) -> GraphExtractionResult {
        let mut entities = Vec::new();
        let mut relationships = Vec::new();
        let mut seen_entities: HashSet<String> = HashSet::new();
        let mut seen_relationships: HashSet<String> = HashSet::new();

        // ── Employment ──────────────────────────────────────
        for cap in RE_WORKS_AT.captures_iter(content) {
            let person = cap["person"].to_string();
            let org = cap["org"].to_string();
            Self::push_entity(&mut entities, &mut seen_entities, &person, EntityType::Person, 0.9);
            Self::push_entity(&mut entities, &mut seen_entities, &org, EntityType::Organization, 0.9);
            Self::push_relationship(
                &mut relationships,
                &mut seen_relationships,
                &person,
                &org,
                "works at",
                0.85,
            );
        }

        // ── Organization location ("works at Acme in Paris") ─
        for cap in RE_ORG_IN.captures_iter(content) {
            let org = cap["org"].to_string();
            let loc = cap["loc"].to_string();
            Self::push_entity(&mut entities, &mut seen_entities, &loc, EntityType::Location, 0.85);
            Self::push_relationship(
                &mut relationships,
                &mut seen_relationships,
                &org,
                &loc,
                "located in",
                0.85,
            );
        }

        // ── Founding ────────────────────────────────────────
        for cap in RE_FOUNDED.captures_iter(content) {
            let person = cap["person"].to_string();
            let org = cap["org"].to_string();
            Self::push_entity(&mut entities, &mut seen_entities, &person, EntityType::Person, 0.9);
            Self::push_entity(&mut entities, &mut seen_entities, &org, EntityType::Organization, 0.9);
            Self::push_relationship(
                &mut relationships,
                &mut seen_relationships,
                &person,
                &org,
                "founded",
                0.85,
            );
        }

        // ── Residence and travel ────────────────────────────
        for cap in RE_LIVES_IN.captures_iter(content) {
            let person = cap["person"].to_string();
            let loc = cap["loc"].to_string();
            Self::push_entity(&mut entities, &mut seen_entities, &person, EntityType::Person, 0.9);
            Self::push_entity(&mut entities, &mut seen_entities, &loc, EntityType::Location, 0.85);
            Self::push_relationship(
                &mut relationships,
                &mut seen_relationships,
                &person,
                &loc,
                "lives in",
                0.85,
            );
        }
        for cap in RE_WENT_TO.captures_iter(content) {
            let person = cap["person"].to_string();
            let loc = cap["loc"].to_string();
            let verb = cap["verb"].split_whitespace().collect::<Vec<_>>().join(" ");
            Self::push_entity(&mut entities, &mut seen_entities, &person, EntityType::Person, 0.9);
            Self::push_entity(&mut entities, &mut seen_entities, &loc, EntityType::Location, 0.85);
            Self::push_relationship(
                &mut relationships,
                &mut seen_relationships,
                &person,
                &loc,
                &verb.to_lowercase(),
                0.8,
            );
        }

        // ── "X is a Y" → role property on X ─────────────────
        for cap in RE_IS_A.captures_iter(content) {
            let subj = cap["subj"].to_string();
            let pred = cap["pred"].trim().to_string();
            let subj_id = sanitize_id(&subj);
            if subj_id.is_empty() || STOP_WORDS.contains(subj_id.as_str()) {
                continue;
            }
            if seen_entities.insert(subj_id.clone()) {
                entities.push(ExtractedEntity {
                    label: subj.clone(),
                    entity_type: EntityType::Person,
                    confidence: 0.8,
                    properties: BTreeMap::new(),
                });
            }
            if let Some(entity) = entities.iter_mut().find(|e| sanitize_id(&e.label) == subj_id) {
                entity
                    .properties
                    .insert("role".to_string(), serde_json::Value::String(pred));
            }
        }

        // ── Bare locations ("meeting in Berlin") ────────────
        for cap in RE_IN_PLACE.captures_iter(content) {
            let loc = cap["loc"].to_string();
            Self::push_entity(&mut entities, &mut seen_entities, &loc, EntityType::Location, 0.75);
        }

        // ── Remaining capitalized mentions, mid-sentence only ─
        for mat in RE_NAME.find_iter(content) {
            let start = mat.start();
            let sentence_initial = start == 0
                || content[..start]
                    .trim_end()
                    .ends_with(['.', '!', '?', '\n']);
            if sentence_initial {
                continue;
            }
            Self::push_entity(
                &mut entities,
                &mut seen_entities,
                mat.as_str(),
                EntityType::Concept,
                0.6,
            );
        }

        let confidence = if entities.is_empty() {
            0.0
        } else {
            entities.iter().map(|e| e.confidence).sum::<f32>() / entities.len() as f32
        };

        GraphExtractionResult {
            entities,
            relationships,
            confidence,
        }
    }
}

#[async_trait]
impl GraphExtractor for HeuristicExtractor {
    async fn extract(&self, content: &str, memory_id: &str) -> Result<GraphExtractionResult> {
        let result = Self::run(content);
        debug!(
            memory_id,
            entities = result.entities.len(),
            relationships = result.relationships.len(),
            "Heuristic extraction complete"
        );
        Ok(result)
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

// ── HTTP extractor ──────────────────────────────────────────────

const EXTRACTION_PROMPT: &str = "Extract entities and relationships from the user's text. \
Respond with JSON only: {\"entities\":[{\"label\":string,\"type\":\"person|organization|location|event|concept|other\",\"confidence\":number}],\
\"relationships\":[{\"source\":string,\"target\":string,\"label\":string,\"confidence\":number}]}";

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ExtractionPayload {
    #[serde(default)]
    entities: Vec<PayloadEntity>,
    #[serde(default)]
    relationships: Vec<PayloadRelationship>,
}

#[derive(Debug, Deserialize)]
struct PayloadEntity {
    label: String,
    #[serde(rename = "type", default)]
    entity_type: String,
    #[serde(default = "default_confidence")]
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct PayloadRelationship {
    source: String,
    target: String,
    label: String,
    #[serde(default = "default_confidence")]
    confidence: f32,
}

fn default_confidence() -> f32 {
    0.8
}

/// LLM-backed extraction over an OpenAI-style chat endpoint.
pub struct HttpExtractor {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl HttpExtractor {
    /// Create an extractor for `base_url` with the given model.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Extraction(format!("client init: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            timeout,
        })
    }

    fn parse_payload(content: &str) -> Result<ExtractionPayload> {
        // Models sometimes wrap JSON in code fences; take the outermost object.
        let start = content.find('{');
        let end = content.rfind('}');
        let json = match (start, end) {
            (Some(s), Some(e)) if e > s => &content[s..=e],
            _ => return Err(Error::Extraction("no JSON object in response".to_string())),
        };
        serde_json::from_str(json).map_err(|e| Error::Extraction(format!("bad payload: {e}")))
    }
}

#[async_trait]
impl GraphExtractor for HttpExtractor {
    async fn extract(&self, content: &str, memory_id: &str) -> Result<GraphExtractionResult> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": EXTRACTION_PROMPT},
                {"role": "user", "content": content},
            ],
            "temperature": 0.0,
        });
        let mut req = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(self.timeout.as_millis() as u64)
            } else {
                Error::Extraction(format!("request failed: {e}"))
            }
        })?;
        if !resp.status().is_success() {
            return Err(Error::Extraction(format!(
                "extraction request failed with status {}",
                resp.status()
            )));
        }
        let chat: ChatResponse = resp
            .json()
            .await
            .map_err(|e| Error::Extraction(format!("bad response: {e}")))?;
        let text = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| Error::Extraction("empty response".to_string()))?;
        let payload = Self::parse_payload(text)?;

        let entities: Vec<ExtractedEntity> = payload
            .entities
            .into_iter()
            .map(|e| ExtractedEntity {
                label: e.label,
                entity_type: EntityType::from_str_lossy(&e.entity_type),
                confidence: e.confidence.clamp(0.0, 1.0),
                properties: BTreeMap::new(),
            })
            .collect();
        let relationships: Vec<ExtractedRelationship> = payload
            .relationships
            .into_iter()
            .map(|r| ExtractedRelationship {
                source: r.source,
                target: r.target,
                label: r.label,
                rel_type: None,
                confidence: r.confidence.clamp(0.0, 1.0),
            })
            .collect();
        let confidence = if entities.is_empty() {
            0.0
        } else {
            entities.iter().map(|e| e.confidence).sum::<f32>() / entities.len() as f32
        };
        debug!(
            memory_id,
            entities = entities.len(),
            relationships = relationships.len(),
            "LLM extraction complete"
        );
        Ok(GraphExtractionResult {
            entities,
            relationships,
            confidence,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}
