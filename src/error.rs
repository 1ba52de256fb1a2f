use thiserror::Error;

/// Main error type for GraphMem
#[derive(Error, Debug)]
pub enum GraphMemError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed episode payload or missing required fields
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Remote backend requested without a configured credential
    #[error("Authentication missing: {0}")]
    AuthenticationMissing(String),

    /// Remote backend signalled rate limiting (HTTP 429)
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Remote backend returned output that does not parse as the expected shape
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Remote backend unreachable (5xx, timeout, connection failure)
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Episode extraction failed after the backend exhausted its retries
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    /// Graph store connectivity loss
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Embedding API errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// HTTP transport errors from remote API clients
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl GraphMemError {
    /// Stable kind string for structured error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            GraphMemError::Database(_) => "database",
            GraphMemError::Io(_) => "io",
            GraphMemError::Config(_) => "config",
            GraphMemError::InvalidInput(_) => "invalid_input",
            GraphMemError::AuthenticationMissing(_) => "authentication_missing",
            GraphMemError::RateLimited(_) => "rate_limited",
            GraphMemError::MalformedResponse(_) => "malformed_response",
            GraphMemError::Unavailable(_) => "unavailable",
            GraphMemError::ExtractionFailed(_) => "extraction_failed",
            GraphMemError::StoreUnavailable(_) => "store_unavailable",
            GraphMemError::Embedding(_) => "embedding",
            GraphMemError::Http(_) => "http",
        }
    }

    /// Whether a failed backend attempt may be retried under the backoff
    /// policy: rate limiting, malformed model output, and unreachability
    /// (5xx, timeout, connect failure). Everything else fails fast.
    pub fn is_retryable(&self) -> bool {
        match self {
            GraphMemError::RateLimited(_)
            | GraphMemError::MalformedResponse(_)
            | GraphMemError::Unavailable(_) => true,
            GraphMemError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

/// Convenient Result type using GraphMemError
pub type Result<T> = std::result::Result<T, GraphMemError>;
