//! Hosted embeddings over an OpenAI-compatible API.
//!
//! Requests pin `dimensions` to the crate-wide vector width and are split
//! into bounded batches with a short pause between full batches. Transient
//! failures (429, 5xx, timeouts) follow the same backoff policy as the
//! extraction backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::backend::RetryPolicy;
use crate::error::{GraphMemError, Result};

use super::{Embedder, EMBEDDING_DIM};

const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Endpoint used when no gateway override is configured.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Pause between consecutive full batches to stay under rate limits.
const BATCH_PACING_MS: u64 = 100;

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Embedder calling a hosted embeddings API.
pub struct RemoteEmbedder {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    batch_size: usize,
    policy: RetryPolicy,
}

impl RemoteEmbedder {
    pub fn new(
        base_url: String,
        api_key: String,
        model: String,
        batch_size: usize,
        policy: RetryPolicy,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");
        RemoteEmbedder {
            client,
            base_url,
            api_key,
            model,
            batch_size: batch_size.max(1),
            policy,
        }
    }

    /// One embeddings request for a single batch, no retry.
    async fn attempt(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            model: self.model.clone(),
            input: texts.to_vec(),
            dimensions: EMBEDDING_DIM,
        };

        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(classify_status(status, body));
        }

        let result: EmbeddingResponse = response.json().await.map_err(|e| {
            GraphMemError::MalformedResponse(format!("Failed to parse embeddings response: {}", e))
        })?;

        if result.data.len() != texts.len() {
            return Err(GraphMemError::Embedding(format!(
                "embeddings API returned {} vectors for {} inputs",
                result.data.len(),
                texts.len()
            )));
        }

        Ok(result.data.into_iter().map(|d| d.embedding).collect())
    }

    /// Embed one batch under the retry policy.
    async fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 0;
        loop {
            match self.attempt(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_retryable() && attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    log::warn!(
                        "Retry {}/{} after error: {}",
                        attempt + 1,
                        self.policy.max_attempts - 1,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    return Err(GraphMemError::Embedding(format!(
                        "embeddings API gave up after {} attempts: {}",
                        self.policy.max_attempts, e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.embed_chunk(&[text.to_string()]).await?;
        vectors.into_iter().next().ok_or_else(|| {
            GraphMemError::Embedding("embeddings API returned no vectors".to_string())
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all_embeddings = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            let embeddings = self.embed_chunk(chunk).await?;
            all_embeddings.extend(embeddings);

            if chunk.len() == self.batch_size {
                tokio::time::sleep(Duration::from_millis(BATCH_PACING_MS)).await;
            }
        }

        Ok(all_embeddings)
    }
}

/// Same taxonomy as the extraction backend: 429 and 5xx retryable,
/// credential rejections and other client errors fail fast.
fn classify_status(status: reqwest::StatusCode, body: String) -> GraphMemError {
    match status.as_u16() {
        429 => GraphMemError::RateLimited(format!("embeddings API error 429: {}", body)),
        401 | 403 => GraphMemError::AuthenticationMissing(format!(
            "embeddings API error {}: {}",
            status, body
        )),
        s if (500..600).contains(&s) => {
            GraphMemError::Unavailable(format!("embeddings API error {}: {}", status, body))
        }
        _ => GraphMemError::Embedding(format!("embeddings API error {}: {}", status, body)),
    }
}
