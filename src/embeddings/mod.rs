//! Text embeddings for semantic re-ranking.
//!
//! All providers emit vectors of the same fixed width so similarity math
//! never has to reconcile dimensions. The remote provider calls a hosted
//! OpenAI-compatible API; when no credential is configured the deterministic
//! hash embedder stands in, which keeps search usable (if less smart) with
//! repeatable output for identical input.

use async_trait::async_trait;

use crate::config::Config;
use crate::error::Result;

pub mod hash;
pub mod remote;

pub use hash::HashEmbedder;
pub use remote::RemoteEmbedder;

/// Fixed embedding width shared by every provider. Config validation
/// rejects any other value, so stored vectors stay comparable.
pub const EMBEDDING_DIM: usize = 384;

/// Trait for generating text embeddings
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Width of the vectors produced by this embedder
    fn dimension(&self) -> usize;

    /// Model name or identifier, for logging
    fn model_name(&self) -> &str;

    /// Embed a single text string
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed multiple texts; providers with a batch API override this
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }
}

/// Build the embedder selected by configuration. The remote provider needs
/// its API key env var set; without it the deterministic fallback takes over
/// rather than failing construction.
pub fn from_config(config: &Config) -> Box<dyn Embedder> {
    if config.embeddings.provider == "openai" {
        if let Some(api_key) = config.embeddings_api_key() {
            return Box::new(RemoteEmbedder::new(
                remote::DEFAULT_BASE_URL.to_string(),
                api_key,
                config.embeddings.model.clone(),
                config.embeddings.batch_size,
                crate::backend::RetryPolicy::default(),
            ));
        }
        log::warn!(
            "Embeddings provider is \"openai\" but {} is not set, using the deterministic fallback embedder",
            config.embeddings.api_key_env
        );
    }
    Box::new(HashEmbedder::new())
}

/// Cosine similarity between two vectors. Zero-magnitude vectors compare
/// as dissimilar rather than dividing by zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, EmbeddingsConfig, GraphMemConfig, SearchConfig};

    #[test]
    fn test_cosine_similarity_identical_vectors() {
        let v = vec![0.6, 0.8, 0.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal_vectors() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_cosine_similarity_opposite_vectors() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![-1.0, -2.0, -3.0];
        let sim = cosine_similarity(&a, &b);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = vec![0.0, 0.0, 0.0];
        let b = vec![1.0, 2.0, 3.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    fn config_with_embeddings(embeddings: EmbeddingsConfig) -> Config {
        Config {
            graphmem: GraphMemConfig {
                db_path: "./graphmem.db".into(),
                default_group_id: "default".to_string(),
                log_level: "info".to_string(),
            },
            backend: BackendConfig::default(),
            embeddings,
            search: SearchConfig::default(),
        }
    }

    #[test]
    fn test_from_config_fallback_provider() {
        let config = config_with_embeddings(EmbeddingsConfig::default());
        let embedder = from_config(&config);
        assert_eq!(embedder.model_name(), "deterministic-hash");
        assert_eq!(embedder.dimension(), EMBEDDING_DIM);
    }

    #[test]
    fn test_from_config_openai_without_key_falls_back() {
        let config = config_with_embeddings(EmbeddingsConfig {
            provider: "openai".to_string(),
            api_key_env: "GRAPHMEM_TEST_NO_SUCH_EMBED_KEY".to_string(),
            ..EmbeddingsConfig::default()
        });
        let embedder = from_config(&config);
        assert_eq!(embedder.model_name(), "deterministic-hash");
    }
}
