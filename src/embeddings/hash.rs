//! Deterministic fallback embedder.
//!
//! Derives a pseudo-embedding from a stable hash of the text: a djb2 seed
//! over the bytes, then a linear-congruential sequence filling each
//! dimension, normalized to unit length. Not a semantic model, but identical
//! input always yields bit-identical output, which keeps similarity ranking
//! stable when no hosted embedding API is configured.

use async_trait::async_trait;

use crate::error::Result;

use super::{Embedder, EMBEDDING_DIM};

// Knuth's MMIX linear-congruential constants.
const LCG_MULTIPLIER: u64 = 6364136223846793005;
const LCG_INCREMENT: u64 = 1442695040888963407;

/// Embedder requiring no credentials or network: vectors are a pure
/// function of the input text.
#[derive(Debug, Clone, Default)]
pub struct HashEmbedder;

impl HashEmbedder {
    pub fn new() -> Self {
        HashEmbedder
    }
}

/// djb2 over the text bytes.
fn seed_from_text(text: &str) -> u64 {
    let mut seed: u64 = 5381;
    for &byte in text.as_bytes() {
        seed = seed.wrapping_mul(33).wrapping_add(byte as u64);
    }
    seed
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    fn model_name(&self) -> &str {
        "deterministic-hash"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut embedding = vec![0.0f32; EMBEDDING_DIM];

        let mut state = seed_from_text(text);
        for value in embedding.iter_mut() {
            state = state.wrapping_mul(LCG_MULTIPLIER).wrapping_add(LCG_INCREMENT);
            // Map the 64-bit state onto [-1, 1].
            *value = (state as i64) as f32 / i64::MAX as f32;
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        Ok(embedding)
    }
}
