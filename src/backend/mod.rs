//! Extraction backends.
//!
//! A backend turns a rendered prompt into one of a small set of structured
//! outputs (entities, edges, missed-entity names, duplicate pairs). Two
//! implementations exist: [`remote::RemoteBackend`] calls an OpenAI-compatible
//! chat completions API with retry and backoff, [`local::LocalBackend`] runs
//! deterministic rule-based extraction so ingestion keeps working without any
//! credentials or network.

pub mod local;
pub mod remote;
pub mod sanitize;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{GraphMemError, Result};
use crate::graph::{DuplicatePair, ExtractedEdge, ExtractedEntity};

pub use local::LocalBackend;
pub use remote::{RemoteBackend, RetryPolicy};

/// Chat role for a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// One message of a rendered prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// The structured output a caller expects from a backend call.
///
/// The shape drives both the JSON schema appended to remote prompts and the
/// parsing of the model's reply, so a backend can never hand back a payload
/// the caller did not ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputShape {
    ExtractedEntities,
    ExtractedEdges,
    MissedEntities,
    DuplicateEntities,
}

impl OutputShape {
    /// Stable key naming the top-level field of the expected JSON object.
    pub fn key(&self) -> &'static str {
        match self {
            OutputShape::ExtractedEntities => "extracted_entities",
            OutputShape::ExtractedEdges => "extracted_edges",
            OutputShape::MissedEntities => "missed_entities",
            OutputShape::DuplicateEntities => "duplicates",
        }
    }

    /// JSON schema for the expected reply, serialized for prompt embedding.
    pub fn schema(&self) -> serde_json::Value {
        match self {
            OutputShape::ExtractedEntities => json!({
                "type": "object",
                "properties": {
                    "extracted_entities": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": {"type": "string"},
                                "entity_type_id": {"type": "integer"},
                                "summary": {"type": "string"}
                            },
                            "required": ["name"]
                        }
                    }
                },
                "required": ["extracted_entities"]
            }),
            OutputShape::ExtractedEdges => json!({
                "type": "object",
                "properties": {
                    "extracted_edges": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "source_name": {"type": "string"},
                                "target_name": {"type": "string"},
                                "relation_type": {"type": "string"},
                                "summary": {"type": "string"}
                            },
                            "required": ["source_name", "target_name", "relation_type"]
                        }
                    }
                },
                "required": ["extracted_edges"]
            }),
            OutputShape::MissedEntities => json!({
                "type": "object",
                "properties": {
                    "missed_entities": {
                        "type": "array",
                        "items": {"type": "string"}
                    }
                },
                "required": ["missed_entities"]
            }),
            OutputShape::DuplicateEntities => json!({
                "type": "object",
                "properties": {
                    "duplicates": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "uuid": {"type": "string"},
                                "duplicate_of": {"type": "string"}
                            },
                            "required": ["uuid", "duplicate_of"]
                        }
                    }
                },
                "required": ["duplicates"]
            }),
        }
    }

    /// Instruction block appended to the final user message so the model
    /// replies with exactly the shape we can parse.
    pub fn schema_instruction(&self) -> String {
        format!(
            "\n\nRespond with a JSON object in the following format:\n\n{}",
            self.schema()
        )
    }

    /// Parse a model reply into the output this shape promises. Any payload
    /// that does not match is a malformed response, which the retry policy
    /// treats as retryable.
    pub fn parse_reply(&self, content: &str) -> Result<ExtractionOutput> {
        let malformed = |e: serde_json::Error| {
            GraphMemError::MalformedResponse(format!(
                "expected {} object: {}",
                self.key(),
                e
            ))
        };
        match self {
            OutputShape::ExtractedEntities => {
                let envelope: EntitiesEnvelope =
                    serde_json::from_str(content).map_err(malformed)?;
                Ok(ExtractionOutput::Entities(envelope.extracted_entities))
            }
            OutputShape::ExtractedEdges => {
                let envelope: EdgesEnvelope =
                    serde_json::from_str(content).map_err(malformed)?;
                Ok(ExtractionOutput::Edges(envelope.extracted_edges))
            }
            OutputShape::MissedEntities => {
                let envelope: MissedEnvelope =
                    serde_json::from_str(content).map_err(malformed)?;
                Ok(ExtractionOutput::Missed(envelope.missed_entities))
            }
            OutputShape::DuplicateEntities => {
                let envelope: DuplicatesEnvelope =
                    serde_json::from_str(content).map_err(malformed)?;
                Ok(ExtractionOutput::Duplicates(envelope.duplicates))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct EntitiesEnvelope {
    #[serde(default)]
    extracted_entities: Vec<ExtractedEntity>,
}

#[derive(Debug, Deserialize)]
struct EdgesEnvelope {
    #[serde(default)]
    extracted_edges: Vec<ExtractedEdge>,
}

#[derive(Debug, Deserialize)]
struct MissedEnvelope {
    #[serde(default)]
    missed_entities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DuplicatesEnvelope {
    #[serde(default)]
    duplicates: Vec<DuplicatePair>,
}

/// Structured result of one backend call.
#[derive(Debug, Clone)]
pub enum ExtractionOutput {
    Entities(Vec<ExtractedEntity>),
    Edges(Vec<ExtractedEdge>),
    Missed(Vec<String>),
    Duplicates(Vec<DuplicatePair>),
}

impl ExtractionOutput {
    pub fn into_entities(self) -> Result<Vec<ExtractedEntity>> {
        match self {
            ExtractionOutput::Entities(entities) => Ok(entities),
            other => Err(other.wrong_variant("extracted_entities")),
        }
    }

    pub fn into_edges(self) -> Result<Vec<ExtractedEdge>> {
        match self {
            ExtractionOutput::Edges(edges) => Ok(edges),
            other => Err(other.wrong_variant("extracted_edges")),
        }
    }

    pub fn into_missed(self) -> Result<Vec<String>> {
        match self {
            ExtractionOutput::Missed(names) => Ok(names),
            other => Err(other.wrong_variant("missed_entities")),
        }
    }

    pub fn into_duplicates(self) -> Result<Vec<DuplicatePair>> {
        match self {
            ExtractionOutput::Duplicates(pairs) => Ok(pairs),
            other => Err(other.wrong_variant("duplicates")),
        }
    }

    fn variant_key(&self) -> &'static str {
        match self {
            ExtractionOutput::Entities(_) => "extracted_entities",
            ExtractionOutput::Edges(_) => "extracted_edges",
            ExtractionOutput::Missed(_) => "missed_entities",
            ExtractionOutput::Duplicates(_) => "duplicates",
        }
    }

    fn wrong_variant(self, expected: &str) -> GraphMemError {
        GraphMemError::MalformedResponse(format!(
            "expected {} but backend produced {}",
            expected,
            self.variant_key()
        ))
    }
}

/// A prompt-in, structured-output-out extraction backend.
///
/// Object safe so the orchestrator can hold a `&dyn ExtractionBackend`
/// chosen per call.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Run one generation and parse it into the requested shape.
    async fn generate(&self, messages: &[Message], shape: OutputShape)
        -> Result<ExtractionOutput>;
}
