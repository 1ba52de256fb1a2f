//! Local extraction backend.
//!
//! Runs the deterministic rule-based extractor over the rendered prompt, so
//! ingestion works with no credentials and no network. Pure function of its
//! input, which makes responses safe to cache: identical prompts are answered
//! from a bounded LRU keyed by a digest of the rendered messages.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::extract::prompts::{EXTRACTED_CLOSE, EXTRACTED_OPEN};
use crate::extract::RuleBasedExtractor;

use super::{ExtractionBackend, ExtractionOutput, Message, OutputShape, Role};

/// Responses kept in the prompt cache.
const CACHE_SIZE: usize = 200;

/// Rule-based extraction backend with a bounded response cache.
pub struct LocalBackend {
    extractor: RuleBasedExtractor,
    cache: Mutex<LruCache<String, ExtractionOutput>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(CACHE_SIZE).expect("Cache capacity must be at least 1");
        LocalBackend {
            extractor: RuleBasedExtractor::new(),
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Content the rules run over: user messages only. System messages carry
    /// instruction boilerplate whose capitalized runs are not entities.
    fn prompt_text(messages: &[Message]) -> String {
        messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Cache key: digest over the expected shape and the full prompt.
    fn cache_key(messages: &[Message], shape: OutputShape) -> String {
        let mut hasher = Sha256::new();
        hasher.update(shape.key().as_bytes());
        for message in messages {
            hasher.update([0u8]);
            hasher.update(message.content.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    fn answer(&self, text: &str, shape: OutputShape) -> ExtractionOutput {
        match shape {
            OutputShape::ExtractedEntities => {
                ExtractionOutput::Entities(self.extractor.extract_entities(text))
            }
            OutputShape::ExtractedEdges => {
                ExtractionOutput::Edges(self.extractor.extract_relations(text))
            }
            OutputShape::MissedEntities => {
                let already = extracted_names(text);
                ExtractionOutput::Missed(self.extractor.missed_entities(text, &already))
            }
            // No merge algorithm runs locally; the shape is answered with
            // the empty stub so callers never special-case this backend.
            OutputShape::DuplicateEntities => ExtractionOutput::Duplicates(Vec::new()),
        }
    }
}

#[async_trait]
impl ExtractionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn generate(
        &self,
        messages: &[Message],
        shape: OutputShape,
    ) -> Result<ExtractionOutput> {
        let key = Self::cache_key(messages, shape);
        if let Some(cached) = self.cache.lock().unwrap().get(&key) {
            log::debug!("Local backend cache hit for {}", shape.key());
            return Ok(cached.clone());
        }

        let text = Self::prompt_text(messages);
        let output = self.answer(&text, shape);
        self.cache.lock().unwrap().put(key, output.clone());
        Ok(output)
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Names listed between the extracted-entities tags of a reflexion prompt.
/// The local backend reads them back out of the rendered text, since the
/// backend contract carries no structured fields beyond the messages.
fn extracted_names(text: &str) -> Vec<String> {
    let Some(start) = text.find(EXTRACTED_OPEN) else {
        return Vec::new();
    };
    let rest = &text[start + EXTRACTED_OPEN.len()..];
    let Some(end) = rest.find(EXTRACTED_CLOSE) else {
        return Vec::new();
    };
    rest[..end]
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}
