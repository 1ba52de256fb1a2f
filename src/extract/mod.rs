//! Extraction orchestration.
//!
//! One episode goes through a bounded reflexion loop: extract entities, ask
//! the backend what it missed, extract again with the missed names folded
//! into the instruction. After the loop settles, a single edge pass runs over
//! the final entity list and edge endpoints are resolved name→id in memory.
//! All backend calls share one semaphore so a burst of episodes cannot
//! stampede the remote API.

pub mod prompts;
pub mod rules;

use std::collections::HashMap;

use tokio::sync::Semaphore;

use crate::backend::{ExtractionBackend, ExtractionOutput, Message, OutputShape};
use crate::error::{GraphMemError, Result};
use crate::graph::{
    batch_edge_uuid, batch_entity_uuid, labels_for_type, Entity, Episode, ExtractedEntity,
    Relation,
};

pub use rules::RuleBasedExtractor;

/// Maximum extract→reflect cycles per episode. The loop stops here even if
/// the backend keeps reporting missed entities.
pub const MAX_REFLEXION_ITERATIONS: usize = 3;

/// Maximum concurrent backend calls per orchestrator.
pub const SEMAPHORE_LIMIT: usize = 5;

/// Truncate to at most `max` characters, marking the cut with an ellipsis.
/// Character-based so multibyte content never splits mid-codepoint.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{}...", head)
    }
}

/// Reflexion loop states. Kept explicit so the transitions and the
/// termination conditions are visible in one match.
enum LoopState {
    Extract,
    Reflect,
    Done,
}

/// Drives node and edge extraction for episodes against a chosen backend.
///
/// Holds the concurrency limiter, so all episodes funneled through one
/// orchestrator share the same cap.
pub struct Orchestrator {
    /// Limits in-flight backend calls to [`SEMAPHORE_LIMIT`].
    limiter: Semaphore,
}

impl Orchestrator {
    pub fn new() -> Self {
        Orchestrator {
            limiter: Semaphore::new(SEMAPHORE_LIMIT),
        }
    }

    /// Extract entities and relations from one episode. `previous` supplies
    /// recent episodes (newest first) as prompt context. Returned entities
    /// carry per-batch ids; relations are already resolved to those ids.
    pub async fn extract_episode(
        &self,
        backend: &dyn ExtractionBackend,
        episode: &Episode,
        previous: &[Episode],
    ) -> Result<(Vec<Entity>, Vec<Relation>)> {
        let candidates = self.extract_nodes(backend, episode, previous).await?;
        let entities = materialize_entities(candidates, episode);
        log::info!(
            "Extracted {} entities from episode {} via {}",
            entities.len(),
            episode.uuid,
            backend.name()
        );

        // Relationships need two endpoints; below that the edge pass is
        // pointless and skipped outright.
        if entities.len() < 2 {
            log::debug!(
                "Skipping edge extraction for episode {}: only {} entities",
                episode.uuid,
                entities.len()
            );
            return Ok((entities, Vec::new()));
        }

        let relations = self
            .extract_edges(backend, episode, previous, &entities)
            .await?;
        log::info!(
            "Extracted {} relations from episode {}",
            relations.len(),
            episode.uuid
        );
        Ok((entities, relations))
    }

    /// The reflexion loop. Candidates from every pass merge into one list,
    /// deduplicated case-insensitively by name, first form wins.
    async fn extract_nodes(
        &self,
        backend: &dyn ExtractionBackend,
        episode: &Episode,
        previous: &[Episode],
    ) -> Result<Vec<ExtractedEntity>> {
        let mut merged: Vec<ExtractedEntity> = Vec::new();
        let mut missed: Vec<String> = Vec::new();
        let mut iterations = 0;
        let mut state = LoopState::Extract;

        loop {
            match state {
                LoopState::Extract => {
                    let messages = prompts::extraction_messages(episode, previous, &missed);
                    let output = self
                        .generate(backend, &messages, OutputShape::ExtractedEntities)
                        .await?;
                    merge_candidates(&mut merged, output.into_entities()?);
                    iterations += 1;
                    state = if iterations >= MAX_REFLEXION_ITERATIONS {
                        LoopState::Done
                    } else {
                        LoopState::Reflect
                    };
                }
                LoopState::Reflect => {
                    let names: Vec<String> = merged.iter().map(|e| e.name.clone()).collect();
                    let messages = prompts::reflexion_messages(episode, previous, &names);
                    let output = self
                        .generate(backend, &messages, OutputShape::MissedEntities)
                        .await?;
                    missed = output.into_missed()?;
                    if missed.is_empty() {
                        state = LoopState::Done;
                    } else {
                        log::debug!(
                            "Reflexion pass {} found {} missed entities for episode {}",
                            iterations,
                            missed.len(),
                            episode.uuid
                        );
                        state = LoopState::Extract;
                    }
                }
                LoopState::Done => break,
            }
        }

        merged.retain(|e| !e.name.trim().is_empty());
        Ok(merged)
    }

    /// Single edge pass over the final entity list, then two-phase name→id
    /// resolution. Edges with an unknown endpoint or identical resolved
    /// endpoints are model noise and dropped.
    async fn extract_edges(
        &self,
        backend: &dyn ExtractionBackend,
        episode: &Episode,
        previous: &[Episode],
        entities: &[Entity],
    ) -> Result<Vec<Relation>> {
        let names: Vec<String> = entities.iter().map(|e| e.name.clone()).collect();
        let messages = prompts::edge_messages(episode, previous, &names);
        let output = self
            .generate(backend, &messages, OutputShape::ExtractedEdges)
            .await?;
        let edges = output.into_edges()?;

        let by_name: HashMap<String, &str> = entities
            .iter()
            .map(|e| (e.name.to_lowercase(), e.uuid.as_str()))
            .collect();

        let mut relations = Vec::new();
        let mut dropped = 0usize;
        for (ordinal, edge) in edges.into_iter().enumerate() {
            let source = by_name.get(&edge.source_name.to_lowercase());
            let target = by_name.get(&edge.target_name.to_lowercase());
            let (Some(&source_uuid), Some(&target_uuid)) = (source, target) else {
                dropped += 1;
                continue;
            };
            if source_uuid == target_uuid {
                dropped += 1;
                continue;
            }
            relations.push(Relation {
                uuid: batch_edge_uuid(&episode.group_id, ordinal),
                source_uuid: source_uuid.to_string(),
                target_uuid: target_uuid.to_string(),
                relation_type: edge.relation_type,
                summary: edge.summary.unwrap_or_default(),
                group_id: episode.group_id.clone(),
                created_at: chrono::Utc::now(),
            });
        }
        if dropped > 0 {
            log::debug!(
                "Dropped {} unresolvable edges for episode {}",
                dropped,
                episode.uuid
            );
        }
        Ok(relations)
    }

    /// One backend call under the concurrency cap.
    async fn generate(
        &self,
        backend: &dyn ExtractionBackend,
        messages: &[Message],
        shape: OutputShape,
    ) -> Result<ExtractionOutput> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| GraphMemError::ExtractionFailed("extraction limiter closed".into()))?;
        backend.generate(messages, shape).await
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge new candidates into the accumulated list, case-insensitive on name.
fn merge_candidates(merged: &mut Vec<ExtractedEntity>, incoming: Vec<ExtractedEntity>) {
    for candidate in incoming {
        let key = candidate.name.to_lowercase();
        if merged.iter().any(|e| e.name.to_lowercase() == key) {
            continue;
        }
        merged.push(candidate);
    }
}

/// Turn surviving candidates into persistable entities: per-batch ids by
/// ordinal, label set from the entity-type hint, empty-name candidates gone.
fn materialize_entities(candidates: Vec<ExtractedEntity>, episode: &Episode) -> Vec<Entity> {
    let now = chrono::Utc::now();
    candidates
        .into_iter()
        .filter(|c| !c.name.trim().is_empty())
        .enumerate()
        .map(|(ordinal, c)| Entity {
            uuid: batch_entity_uuid(&episode.group_id, ordinal),
            name: c.name.trim().to_string(),
            labels: labels_for_type(c.entity_type_id),
            summary: c.summary.unwrap_or_default(),
            group_id: episode.group_id.clone(),
            created_at: now,
        })
        .collect()
}
