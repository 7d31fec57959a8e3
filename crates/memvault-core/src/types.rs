//! Core domain types.
//!
//! A **memory** is a short piece of user content to be remembered. The
//! engine never mutates a memory after creation; re-extraction requires
//! an explicit `force_reprocess` at the call site.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single user memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Unique memory ID (UUID)
    pub id: String,
    /// Owner of this memory; every persistent structure is keyed by it
    pub user_id: String,
    /// Full memory text
    pub content: String,
    /// Category (general, knowledge, preference, event, …)
    pub category: String,
    /// When this memory was created
    pub created_at: DateTime<Utc>,
    /// Optional importance weight (0.0–1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance: Option<f32>,
    /// Optional topic label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Opaque caller-supplied metadata, stored alongside the vector
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_metadata: Option<serde_json::Value>,
}

impl Memory {
    /// Create a memory with a fresh UUID and the current timestamp.
    pub fn new(user_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            content: content.into(),
            category: "general".to_string(),
            created_at: Utc::now(),
            importance: None,
            topic: None,
            custom_metadata: None,
        }
    }

    /// Set the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Set the importance weight.
    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    /// Set the topic label.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_builder() {
        let mem = Memory::new("u1", "Alice works at Acme")
            .with_category("knowledge")
            .with_importance(0.8)
            .with_topic("work");
        assert_eq!(mem.user_id, "u1");
        assert_eq!(mem.category, "knowledge");
        assert_eq!(mem.importance, Some(0.8));
        assert_eq!(mem.topic.as_deref(), Some("work"));
        assert!(!mem.id.is_empty());
    }

    #[test]
    fn test_memory_serialization_roundtrip() {
        let mem = Memory::new("u1", "hello");
        let json = serde_json::to_string(&mem).unwrap();
        let back: Memory = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, mem.id);
        assert_eq!(back.content, "hello");
    }

    #[test]
    fn test_optional_fields_skipped() {
        let mem = Memory::new("u1", "hello");
        let json = serde_json::to_string(&mem).unwrap();
        assert!(!json.contains("importance"));
        assert!(!json.contains("topic"));
    }
}
