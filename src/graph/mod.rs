//! Knowledge graph module: domain model and SQLite-backed store.
//!
//! Episodes are append-only ingestion records; entities and typed relations
//! are extracted from them and persisted atomically per episode, with
//! mention links recording which episode an entity came from.

pub mod store;

pub use store::{EntityHit, GraphStats, GraphStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How an episode's content should be interpreted by the extraction prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeSource {
    Message,
    Text,
    Json,
    Conversation,
}

impl EpisodeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeSource::Message => "message",
            EpisodeSource::Text => "text",
            EpisodeSource::Json => "json",
            EpisodeSource::Conversation => "conversation",
        }
    }

    /// Parse a stored/user-supplied source kind; unknown kinds fall back to `text`.
    pub fn parse(s: &str) -> Self {
        match s {
            "message" => EpisodeSource::Message,
            "json" => EpisodeSource::Json,
            "conversation" => EpisodeSource::Conversation,
            _ => EpisodeSource::Text,
        }
    }
}

impl Default for EpisodeSource {
    fn default() -> Self {
        EpisodeSource::Text
    }
}

/// One ingested unit of content plus metadata. Append-only, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    /// Unique identifier (UUID v4).
    pub uuid: String,
    pub name: String,
    /// Tenant/namespace scope.
    pub group_id: String,
    pub source: EpisodeSource,
    pub source_description: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub valid_at: DateTime<Utc>,
}

impl Episode {
    pub fn new(
        name: impl Into<String>,
        content: impl Into<String>,
        source_description: impl Into<String>,
        group_id: impl Into<String>,
        source: EpisodeSource,
    ) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4().to_string(),
            name: name.into(),
            group_id: group_id.into(),
            source,
            source_description: source_description.into(),
            content: content.into(),
            created_at: now,
            valid_at: now,
        }
    }
}

/// A named concept/actor extracted from episodes.
///
/// Labels always contain the generic `"Entity"` label, plus the entity-type
/// label when the extraction assigned one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub uuid: String,
    pub name: String,
    pub labels: Vec<String>,
    pub summary: String,
    pub group_id: String,
    pub created_at: DateTime<Utc>,
}

/// A directed, typed relationship between two entities
/// (source --relation_type--> target). Source and target always differ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub uuid: String,
    pub source_uuid: String,
    pub target_uuid: String,
    pub relation_type: String,
    pub summary: String,
    pub group_id: String,
    pub created_at: DateTime<Utc>,
}

/// Transient entity candidate produced by a backend. Named by display label,
/// not id; ids are assigned after the reflexion loop finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(default)]
    pub entity_type_id: usize,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Transient edge candidate produced by a backend. Endpoints are entity
/// names; the orchestrator resolves them against the batch's name→id map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEdge {
    pub source_name: String,
    pub target_name: String,
    pub relation_type: String,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Cross-episode duplicate pair. Stub capability: the shape exists and
/// backends answer duplicate-pair requests, but no merge algorithm runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicatePair {
    pub uuid: String,
    pub duplicate_of: String,
}

/// Coarse entity classification passed to backends as extraction context.
#[derive(Debug, Clone, Serialize)]
pub struct EntityType {
    pub id: usize,
    pub name: &'static str,
    pub description: &'static str,
}

/// The built-in entity type registry. Index 0 is the generic default; a
/// candidate's `entity_type_id` indexes this table and out-of-range hints
/// degrade to the default.
pub const ENTITY_TYPES: &[EntityType] = &[
    EntityType { id: 0, name: "Entity", description: "Default entity classification, used when nothing more specific applies" },
    EntityType { id: 1, name: "Person", description: "A human actor: user, customer, employee, named individual" },
    EntityType { id: 2, name: "Organization", description: "A company, team, institution or other collective actor" },
    EntityType { id: 3, name: "System", description: "A software system, application, service or platform" },
    EntityType { id: 4, name: "Contact", description: "A contact handle such as an email address or URL" },
];

/// Label set for an entity candidate: the generic label plus the type label
/// when the type hint names something more specific.
pub fn labels_for_type(entity_type_id: usize) -> Vec<String> {
    let ty = ENTITY_TYPES.get(entity_type_id).unwrap_or(&ENTITY_TYPES[0]);
    if ty.id == 0 {
        vec!["Entity".to_string()]
    } else {
        vec!["Entity".to_string(), ty.name.to_string()]
    }
}

/// Per-batch entity id: group id plus ordinal position within the pass.
pub fn batch_entity_uuid(group_id: &str, ordinal: usize) -> String {
    format!("{}-{}", group_id, ordinal)
}

/// Per-batch edge id.
pub fn batch_edge_uuid(group_id: &str, ordinal: usize) -> String {
    format!("{}-edge-{}", group_id, ordinal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_episode_source_round_trip() {
        assert_eq!(EpisodeSource::parse("message"), EpisodeSource::Message);
        assert_eq!(EpisodeSource::parse("json"), EpisodeSource::Json);
        assert_eq!(EpisodeSource::parse("conversation"), EpisodeSource::Conversation);
        assert_eq!(EpisodeSource::parse("text"), EpisodeSource::Text);
        // Unknown kinds degrade to text instead of failing ingestion.
        assert_eq!(EpisodeSource::parse("carrier-pigeon"), EpisodeSource::Text);
        assert_eq!(EpisodeSource::Message.as_str(), "message");
    }

    #[test]
    fn test_episode_new_assigns_uuid_and_timestamps() {
        let ep = Episode::new("greeting", "hello", "unit test", "group-1", EpisodeSource::Message);
        assert_eq!(ep.uuid.len(), 36);
        assert_eq!(ep.group_id, "group-1");
        assert_eq!(ep.created_at, ep.valid_at);
    }

    #[test]
    fn test_labels_for_type() {
        assert_eq!(labels_for_type(0), vec!["Entity"]);
        assert_eq!(labels_for_type(2), vec!["Entity", "Organization"]);
        // Out-of-range hints degrade to the default label set.
        assert_eq!(labels_for_type(99), vec!["Entity"]);
    }

    #[test]
    fn test_batch_ids() {
        assert_eq!(batch_entity_uuid("default", 0), "default-0");
        assert_eq!(batch_edge_uuid("default", 3), "default-edge-3");
    }

    #[test]
    fn test_extracted_entity_deserializes_with_defaults() {
        let e: ExtractedEntity = serde_json::from_str(r#"{"name": "ACME"}"#).unwrap();
        assert_eq!(e.name, "ACME");
        assert_eq!(e.entity_type_id, 0);
        assert!(e.summary.is_none());
    }
}
