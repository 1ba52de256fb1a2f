//! Deterministic rule-based extraction.
//!
//! The local backend trades recall for availability: a handful of
//! regex heuristics over the rendered prompt text stand in for a language
//! model. Results are intentionally lossy but stable, so ingestion keeps
//! producing a usable graph when no remote credential is configured or the
//! remote API is down.

use regex::Regex;

use crate::graph::{ExtractedEdge, ExtractedEntity};

use super::truncate_chars;

/// Upper bound on entities reported by one extraction pass.
pub const MAX_ENTITIES: usize = 20;
/// Upper bound on names reported by one reflexion pass.
pub const MAX_MISSED_ENTITIES: usize = 10;
/// Upper bound on relations reported by one edge pass.
pub const MAX_RELATIONS: usize = 15;

/// Longest characters kept of a sentence used as an entity summary.
const SUMMARY_CHARS: usize = 200;
/// Longest characters kept of a sentence used as an edge summary.
const EDGE_SUMMARY_CHARS: usize = 100;
/// Sentences shorter than this never yield relations.
const MIN_SENTENCE_CHARS: usize = 10;

/// Structural words from prompt templates. A capitalized run made up
/// entirely of these is scaffolding, not an entity.
const TEMPLATE_WORDS: &[&str] = &[
    "previous", "messages", "message", "current", "entity", "entities",
    "types", "text", "json", "episode", "episodes", "content", "extracted",
    "guidelines", "respond", "review", "extract",
];

/// Relationship indicator phrases and the relation type they normalize to.
const INDICATORS: &[(&str, &str)] = &[
    ("works for", "works_at"),
    ("works at", "works_at"),
    ("manages", "manages"),
    ("reports to", "reports_to"),
    ("founded", "founded"),
    ("lives in", "lives_in"),
    ("lived in", "lives_in"),
    ("leads", "leads"),
    ("created", "created"),
    ("owns", "owns"),
    ("uses", "uses"),
    ("depends on", "depends_on"),
    ("is part of", "is_part_of"),
    ("contains", "contains"),
    ("belongs to", "belongs_to"),
];

pub struct RuleBasedExtractor {
    proper_noun: Regex,
    sentence_split: Regex,
    indicators: Vec<(Regex, &'static str)>,
}

impl RuleBasedExtractor {
    pub fn new() -> Self {
        // Two or more capitalized words on one line, e.g. "John Doe" or
        // "ACME Corporation". Single capitalized words are too noisy to
        // keep when scanning rendered prompts.
        let proper_noun =
            Regex::new(r"\b(?:[A-Z][a-z]+|[A-Z]{2,})(?:[ \t]+(?:[A-Z][a-z]+|[A-Z]{2,}))+\b")
                .expect("Invalid proper noun pattern");
        let sentence_split = Regex::new(r"[.!?\n\r]+").expect("Invalid sentence pattern");
        let indicators = INDICATORS
            .iter()
            .map(|(phrase, rel_type)| {
                let pattern = format!(r"(?i)\b{}\b", phrase.replace(' ', r"[ \t]+"));
                (
                    Regex::new(&pattern).expect("Invalid indicator pattern"),
                    *rel_type,
                )
            })
            .collect();
        RuleBasedExtractor {
            proper_noun,
            sentence_split,
            indicators,
        }
    }

    /// Scan `text` for entity candidates: capitalized multi-word runs,
    /// template noise filtered, deduplicated case-insensitively in
    /// discovery order, capped at [`MAX_ENTITIES`].
    pub fn extract_entities(&self, text: &str) -> Vec<ExtractedEntity> {
        let mut entities = Vec::new();
        for name in self.candidate_names(text) {
            entities.push(ExtractedEntity {
                entity_type_id: classify(&name),
                summary: Some(self.summary_for(&name, text)),
                name,
            });
            if entities.len() >= MAX_ENTITIES {
                break;
            }
        }
        entities
    }

    /// Re-scan `text` and report candidate names not present in `already`,
    /// capped at [`MAX_MISSED_ENTITIES`]. Used for reflexion passes.
    pub fn missed_entities(&self, text: &str, already: &[String]) -> Vec<String> {
        let known: Vec<String> = already.iter().map(|n| n.to_lowercase()).collect();
        self.candidate_names(text)
            .into_iter()
            .filter(|name| !known.contains(&name.to_lowercase()))
            .take(MAX_MISSED_ENTITIES)
            .collect()
    }

    /// Scan `text` sentence by sentence for indicator phrases and nominate
    /// the nearest capitalized runs on either side as relation endpoints.
    /// Capped at [`MAX_RELATIONS`].
    pub fn extract_relations(&self, text: &str) -> Vec<ExtractedEdge> {
        let mut edges = Vec::new();
        for raw in self.sentence_split.split(text) {
            let sentence = raw.trim();
            if sentence.chars().count() < MIN_SENTENCE_CHARS {
                continue;
            }
            let spans: Vec<regex::Match<'_>> =
                self.proper_noun.find_iter(sentence).collect();
            if spans.len() < 2 {
                continue;
            }
            for (pattern, rel_type) in &self.indicators {
                let Some(hit) = pattern.find(sentence) else {
                    continue;
                };
                let source = spans
                    .iter()
                    .rev()
                    .find(|s| s.end() <= hit.start() && !is_template_noise(s.as_str()));
                let target = spans
                    .iter()
                    .find(|s| s.start() >= hit.end() && !is_template_noise(s.as_str()));
                let (Some(source), Some(target)) = (source, target) else {
                    continue;
                };
                if source.as_str().eq_ignore_ascii_case(target.as_str()) {
                    continue;
                }
                edges.push(ExtractedEdge {
                    source_name: source.as_str().to_string(),
                    target_name: target.as_str().to_string(),
                    relation_type: rel_type.to_string(),
                    summary: Some(truncate_chars(sentence, EDGE_SUMMARY_CHARS)),
                });
                if edges.len() >= MAX_RELATIONS {
                    return edges;
                }
            }
        }
        edges
    }

    /// Candidate names in discovery order, deduplicated case-insensitively.
    fn candidate_names(&self, text: &str) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        let mut names = Vec::new();
        for m in self.proper_noun.find_iter(text) {
            let candidate = m.as_str().trim();
            if is_template_noise(candidate) {
                continue;
            }
            let key = candidate.to_lowercase();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            names.push(candidate.to_string());
        }
        names
    }

    /// First sentence mentioning `name`, truncated, or a generic fallback.
    fn summary_for(&self, name: &str, text: &str) -> String {
        let needle = name.to_lowercase();
        for raw in self.sentence_split.split(text) {
            let sentence = raw.trim();
            if !sentence.is_empty() && sentence.to_lowercase().contains(&needle) {
                return truncate_chars(sentence, SUMMARY_CHARS);
            }
        }
        format!("Entity mentioned in the context: {}", name)
    }
}

impl Default for RuleBasedExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn is_template_noise(candidate: &str) -> bool {
    candidate
        .split_whitespace()
        .all(|word| TEMPLATE_WORDS.contains(&word.to_lowercase().as_str()))
}

/// Keyword-based entity type classification over the candidate name.
fn classify(name: &str) -> usize {
    let lower = name.to_lowercase();
    let person = ["user", "person", "customer", "employee"];
    let organization = ["company", "organization", "corp", "inc"];
    let system = ["system", "application", "software", "platform"];
    if person.iter().any(|k| lower.contains(k)) {
        1
    } else if organization.iter().any(|k| lower.contains(k)) {
        2
    } else if system.iter().any(|k| lower.contains(k)) {
        3
    } else if lower.contains('@') || lower.contains("http") {
        4
    } else {
        0
    }
}
