//! Remote extraction backend over an OpenAI-compatible chat completions API.
//!
//! Each call renders the prompt, appends the expected JSON schema to the
//! final message, and parses the reply content against that schema. Transient
//! failures (429, 5xx, timeouts, malformed replies) are retried with
//! exponential backoff and jitter; everything else fails fast.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::config::Config;
use crate::error::{GraphMemError, Result};

use super::sanitize::sanitize_messages;
use super::{ExtractionBackend, ExtractionOutput, Message, OutputShape};

/// Per-call HTTP timeout. A hung completion call counts as retryable.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Endpoint used when the config does not override `backend.base_url`.
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Backoff schedule for retryable backend failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    /// Delay before the first retry; doubles per subsequent retry.
    pub base_delay: Duration,
    /// Ceiling applied before jitter.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry following `attempt` (0-based): capped
    /// exponential with a jitter factor so synchronized clients spread out.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let mut delay = self.base_delay;
        for _ in 0..attempt {
            delay = delay.saturating_mul(2);
            if delay >= self.max_delay {
                break;
            }
        }
        delay.min(self.max_delay).mul_f64(jitter_factor())
    }
}

/// Jitter factor in [0.75, 1.25), sourced from clock nanoseconds. Coarse,
/// but enough to de-synchronize retry storms without an RNG crate.
fn jitter_factor() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    0.75 + (nanos % 1000) as f64 / 2000.0
}

/// Extraction backend calling a hosted language model.
#[derive(Debug)]
pub struct RemoteBackend {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_output_tokens: u32,
    policy: RetryPolicy,
}

impl RemoteBackend {
    /// Build the remote backend from configuration. The API key is resolved
    /// from the configured environment variable; a missing key is an
    /// authentication error, not a silent downgrade.
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config.backend_api_key().ok_or_else(|| {
            GraphMemError::AuthenticationMissing(format!(
                "environment variable {} is not set",
                config.backend.api_key_env
            ))
        })?;
        let base_url = config
            .backend
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(Self::new(
            base_url,
            api_key,
            config.backend.model.clone(),
            config.backend.max_output_tokens,
            RetryPolicy::default(),
        ))
    }

    pub fn new(
        base_url: String,
        api_key: String,
        model: String,
        max_output_tokens: u32,
        policy: RetryPolicy,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");
        RemoteBackend {
            client,
            base_url,
            api_key,
            model,
            max_output_tokens,
            policy,
        }
    }

    /// Chat completions request body. The schema instruction rides on the
    /// final message so it is the last thing the model reads.
    fn request_body(&self, messages: &[Message], shape: OutputShape) -> serde_json::Value {
        let mut messages = messages.to_vec();
        if let Some(last) = messages.last_mut() {
            last.content.push_str(&shape.schema_instruction());
        }
        json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_output_tokens,
            "temperature": 0,
        })
    }

    /// One request/parse attempt.
    async fn attempt(
        &self,
        body: &serde_json::Value,
        shape: OutputShape,
    ) -> Result<ExtractionOutput> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
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

        let value: serde_json::Value = response.json().await.map_err(|e| {
            GraphMemError::MalformedResponse(format!("Failed to parse response body: {}", e))
        })?;
        let content = value["choices"]
            .get(0)
            .and_then(|choice| choice["message"]["content"].as_str())
            .ok_or_else(|| {
                GraphMemError::MalformedResponse("reply carries no message content".to_string())
            })?;
        shape.parse_reply(content)
    }
}

#[async_trait]
impl ExtractionBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn generate(
        &self,
        messages: &[Message],
        shape: OutputShape,
    ) -> Result<ExtractionOutput> {
        let messages = sanitize_messages(messages);
        let body = self.request_body(&messages, shape);

        let mut attempt = 0;
        loop {
            match self.attempt(&body, shape).await {
                Ok(output) => return Ok(output),
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
                    return Err(GraphMemError::ExtractionFailed(format!(
                        "remote backend gave up after {} attempts: {}",
                        self.policy.max_attempts, e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Map a non-success HTTP response onto the error taxonomy: 429 and 5xx are
/// retryable, credential rejections and everything else fail fast.
fn classify_status(status: reqwest::StatusCode, body: String) -> GraphMemError {
    match status.as_u16() {
        429 => GraphMemError::RateLimited(format!("backend API error 429: {}", body)),
        401 | 403 => {
            GraphMemError::AuthenticationMissing(format!("backend API error {}: {}", status, body))
        }
        s if (500..600).contains(&s) => {
            GraphMemError::Unavailable(format!("backend API error {}: {}", status, body))
        }
        _ => GraphMemError::ExtractionFailed(format!("backend API error {}: {}", status, body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, Config, EmbeddingsConfig, GraphMemConfig, SearchConfig};
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Chat-completions stub: fails the first `failures` requests with
    /// `failure_status`, then replies with `reply`. Captures request bodies.
    struct Stub {
        hits: AtomicUsize,
        failures: usize,
        failure_status: StatusCode,
        reply: serde_json::Value,
        captured: Mutex<Vec<serde_json::Value>>,
    }

    impl Stub {
        fn new(failures: usize, failure_status: StatusCode, content: &str) -> Arc<Self> {
            Arc::new(Stub {
                hits: AtomicUsize::new(0),
                failures,
                failure_status,
                reply: json!({
                    "choices": [{"message": {"role": "assistant", "content": content}}]
                }),
                captured: Mutex::new(Vec::new()),
            })
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    async fn completions(
        State(stub): State<Arc<Stub>>,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        let n = stub.hits.fetch_add(1, Ordering::SeqCst);
        stub.captured.lock().unwrap().push(body);
        if n < stub.failures {
            (stub.failure_status, Json(json!({"error": "stub failure"})))
        } else {
            (StatusCode::OK, Json(stub.reply.clone()))
        }
    }

    async fn spawn_stub(stub: Arc<Stub>) -> String {
        let app = Router::new()
            .route("/chat/completions", post(completions))
            .with_state(stub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    fn backend(base_url: String) -> RemoteBackend {
        RemoteBackend::new(
            base_url,
            "test-key".to_string(),
            "gpt-4o-mini".to_string(),
            512,
            fast_policy(),
        )
    }

    fn entities_content() -> &'static str {
        r#"{"extracted_entities": [{"name": "Alice Johnson", "entity_type_id": 1}]}"#
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let stub = Stub::new(0, StatusCode::SERVICE_UNAVAILABLE, entities_content());
        let url = spawn_stub(Arc::clone(&stub)).await;
        let backend = backend(url);

        let output = backend
            .generate(
                &[Message::system("extract"), Message::user("Alice Johnson")],
                OutputShape::ExtractedEntities,
            )
            .await
            .unwrap();

        let entities = output.into_entities().unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name, "Alice Johnson");
        assert_eq!(stub.hits(), 1);
    }

    #[tokio::test]
    async fn test_request_body_carries_model_and_schema() {
        let stub = Stub::new(0, StatusCode::SERVICE_UNAVAILABLE, entities_content());
        let url = spawn_stub(Arc::clone(&stub)).await;
        let backend = backend(url);

        backend
            .generate(
                &[Message::system("extract"), Message::user("Ali\u{200B}ce")],
                OutputShape::ExtractedEntities,
            )
            .await
            .unwrap();

        let captured = stub.captured.lock().unwrap();
        let body = &captured[0];
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["temperature"], 0);
        assert_eq!(body["max_tokens"], 512);
        let last = body["messages"].as_array().unwrap().last().unwrap().clone();
        let content = last["content"].as_str().unwrap();
        // Zero-width characters stripped, schema instruction appended last.
        assert!(content.starts_with("Alice"));
        assert!(content.contains("Respond with a JSON object"));
        assert!(content.contains("extracted_entities"));
    }

    #[tokio::test]
    async fn test_retries_on_503_then_succeeds() {
        let stub = Stub::new(3, StatusCode::SERVICE_UNAVAILABLE, entities_content());
        let url = spawn_stub(Arc::clone(&stub)).await;
        let backend = backend(url);

        let output = backend
            .generate(&[Message::user("Alice Johnson")], OutputShape::ExtractedEntities)
            .await
            .unwrap();

        assert_eq!(output.into_entities().unwrap().len(), 1);
        assert_eq!(stub.hits(), 4);
    }

    #[tokio::test]
    async fn test_retries_on_rate_limit() {
        let stub = Stub::new(1, StatusCode::TOO_MANY_REQUESTS, entities_content());
        let url = spawn_stub(Arc::clone(&stub)).await;
        let backend = backend(url);

        let output = backend
            .generate(&[Message::user("Alice Johnson")], OutputShape::ExtractedEntities)
            .await
            .unwrap();

        assert_eq!(output.into_entities().unwrap().len(), 1);
        assert_eq!(stub.hits(), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let stub = Stub::new(10, StatusCode::SERVICE_UNAVAILABLE, entities_content());
        let url = spawn_stub(Arc::clone(&stub)).await;
        let backend = backend(url);

        let err = backend
            .generate(&[Message::user("anything")], OutputShape::ExtractedEntities)
            .await
            .unwrap_err();

        assert!(matches!(err, GraphMemError::ExtractionFailed(_)));
        assert_eq!(stub.hits(), 4);
    }

    #[tokio::test]
    async fn test_client_error_fails_fast() {
        let stub = Stub::new(10, StatusCode::BAD_REQUEST, entities_content());
        let url = spawn_stub(Arc::clone(&stub)).await;
        let backend = backend(url);

        let err = backend
            .generate(&[Message::user("anything")], OutputShape::ExtractedEntities)
            .await
            .unwrap_err();

        assert!(matches!(err, GraphMemError::ExtractionFailed(_)));
        assert_eq!(stub.hits(), 1);
    }

    #[tokio::test]
    async fn test_credential_rejection_fails_fast() {
        let stub = Stub::new(10, StatusCode::UNAUTHORIZED, entities_content());
        let url = spawn_stub(Arc::clone(&stub)).await;
        let backend = backend(url);

        let err = backend
            .generate(&[Message::user("anything")], OutputShape::ExtractedEntities)
            .await
            .unwrap_err();

        assert!(matches!(err, GraphMemError::AuthenticationMissing(_)));
        assert_eq!(stub.hits(), 1);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_retried_then_exhausts() {
        let stub = Stub::new(0, StatusCode::SERVICE_UNAVAILABLE, "no json here");
        let url = spawn_stub(Arc::clone(&stub)).await;
        let backend = backend(url);

        let err = backend
            .generate(&[Message::user("anything")], OutputShape::ExtractedEntities)
            .await
            .unwrap_err();

        assert!(matches!(err, GraphMemError::ExtractionFailed(_)));
        assert!(err.to_string().contains("Malformed response"));
        assert_eq!(stub.hits(), 4);
    }

    #[tokio::test]
    async fn test_from_config_without_key_is_authentication_missing() {
        let config = Config {
            graphmem: GraphMemConfig {
                db_path: "./graphmem.db".into(),
                default_group_id: "default".to_string(),
                log_level: "info".to_string(),
            },
            backend: BackendConfig {
                api_key_env: "GRAPHMEM_TEST_NO_SUCH_KEY".to_string(),
                ..BackendConfig::default()
            },
            embeddings: EmbeddingsConfig::default(),
            search: SearchConfig::default(),
        };

        let err = RemoteBackend::from_config(&config).unwrap_err();
        assert!(matches!(err, GraphMemError::AuthenticationMissing(_)));
        assert!(err.to_string().contains("GRAPHMEM_TEST_NO_SUCH_KEY"));
    }

    #[test]
    fn test_delay_doubles_and_respects_cap() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
        };
        // Jitter is ±25%, so check bands rather than exact values.
        let first = policy.delay_for(0);
        assert!(first >= Duration::from_millis(3_750) && first <= Duration::from_millis(6_250));
        let second = policy.delay_for(1);
        assert!(second >= Duration::from_millis(7_500) && second <= Duration::from_millis(12_500));
        // Far past the cap the ceiling still holds (modulo jitter).
        let capped = policy.delay_for(12);
        assert!(capped <= Duration::from_secs(150));
        assert!(capped >= Duration::from_secs(90));
    }
}
