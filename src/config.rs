use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub graphmem: GraphMemConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GraphMemConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_group_id")]
    pub default_group_id: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Extraction backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// "openai" (remote, OpenAI-compatible) or "local" (rule-based only)
    #[serde(default = "default_backend_provider")]
    pub provider: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_backend_model")]
    pub model: String,
    /// Override for OpenAI-compatible endpoints (e.g. a local gateway)
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: default_backend_provider(),
            api_key_env: default_api_key_env(),
            model: default_backend_model(),
            base_url: None,
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

/// Embeddings configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsConfig {
    /// "openai" (remote) or "fallback" (deterministic hash embedder)
    #[serde(default = "default_embeddings_provider")]
    pub provider: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_embeddings_model")]
    pub model: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: default_embeddings_provider(),
            api_key_env: default_api_key_env(),
            model: default_embeddings_model(),
            dimensions: default_dimensions(),
            batch_size: default_batch_size(),
        }
    }
}

/// Search configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_limit")]
    pub default_limit: usize,
    /// Capacity of the query-embedding cache used for semantic re-ranking
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_search_limit(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_group_id() -> String {
    "default".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_backend_provider() -> String {
    "local".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_backend_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_output_tokens() -> u32 {
    2048
}

fn default_embeddings_provider() -> String {
    "fallback".to_string()
}

fn default_embeddings_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_dimensions() -> usize {
    384
}

fn default_batch_size() -> usize {
    100
}

fn default_search_limit() -> usize {
    10
}

fn default_cache_capacity() -> usize {
    1000
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in GRAPHMEM_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        // Load .env file if it exists (ignore errors - file is optional)
        let _ = dotenv::dotenv();

        let config_path = std::env::var("GRAPHMEM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&config_str)
            .context("Failed to parse config.toml")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// A missing API key is deliberately not a validation error: it forces
    /// local-only extraction and the fallback embedder instead.
    fn validate(&self) -> Result<()> {
        match self.backend.provider.as_str() {
            "openai" | "local" => {}
            other => anyhow::bail!(
                "backend.provider must be \"openai\" or \"local\", got \"{}\"",
                other
            ),
        }

        match self.embeddings.provider.as_str() {
            "openai" | "fallback" => {}
            other => anyhow::bail!(
                "embeddings.provider must be \"openai\" or \"fallback\", got \"{}\"",
                other
            ),
        }

        if self.embeddings.dimensions != crate::embeddings::EMBEDDING_DIM {
            anyhow::bail!(
                "embeddings.dimensions must be {} (fixed vector width), got {}",
                crate::embeddings::EMBEDDING_DIM,
                self.embeddings.dimensions
            );
        }

        if self.embeddings.batch_size == 0 {
            anyhow::bail!("embeddings.batch_size must be greater than 0");
        }

        if self.search.default_limit == 0 {
            anyhow::bail!("search.default_limit must be greater than 0");
        }

        if self.search.cache_capacity == 0 {
            anyhow::bail!("search.cache_capacity must be greater than 0");
        }

        if self.graphmem.default_group_id.trim().is_empty() {
            anyhow::bail!("graphmem.default_group_id must not be empty");
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.graphmem.db_path
    }

    /// Get the default group id for episodes ingested without one
    pub fn default_group_id(&self) -> &str {
        &self.graphmem.default_group_id
    }

    /// Remote backend API key, if the configured env var is set
    pub fn backend_api_key(&self) -> Option<String> {
        std::env::var(&self.backend.api_key_env).ok()
    }

    /// Embeddings API key, if the configured env var is set
    pub fn embeddings_api_key(&self) -> Option<String> {
        std::env::var(&self.embeddings.api_key_env).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize config tests that mutate process-wide cwd and env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    fn create_test_config() -> String {
        r#"
[graphmem]
db_path = "./test.db"
default_group_id = "tenant-a"
log_level = "debug"

[backend]
provider = "openai"
api_key_env = "OPENAI_API_KEY"
model = "gpt-4o-mini"
max_output_tokens = 1024

[embeddings]
provider = "fallback"
model = "text-embedding-3-small"
api_key_env = "OPENAI_API_KEY"
batch_size = 100
dimensions = 384

[search]
default_limit = 5
cache_capacity = 64
"#
        .to_string()
    }

    /// Restores cwd when dropped (e.g. on panic).
    struct CwdGuard(std::path::PathBuf);
    impl Drop for CwdGuard {
        fn drop(&mut self) {
            let _ = std::env::set_current_dir(&self.0);
        }
    }

    fn with_config_env(config_path: &std::path::Path, api_key: Option<&str>, f: impl FnOnce()) {
        let original_config = std::env::var("GRAPHMEM_CONFIG").ok();
        let original_key = std::env::var("OPENAI_API_KEY").ok();
        std::env::set_var("GRAPHMEM_CONFIG", config_path.to_str().unwrap());
        match api_key {
            Some(k) => std::env::set_var("OPENAI_API_KEY", k),
            None => std::env::remove_var("OPENAI_API_KEY"),
        }
        f();
        std::env::remove_var("GRAPHMEM_CONFIG");
        std::env::remove_var("OPENAI_API_KEY");
        if let Some(val) = original_config {
            std::env::set_var("GRAPHMEM_CONFIG", val);
        }
        if let Some(val) = original_key {
            std::env::set_var("OPENAI_API_KEY", val);
        }
    }

    #[test]
    fn test_config_load_success() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, create_test_config()).unwrap();
        let config_path = config_path.canonicalize().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        let _cwd = CwdGuard(original_dir.clone());
        std::env::set_current_dir(temp_dir.path()).unwrap();
        with_config_env(&config_path, Some("test-key"), || {
            let config = Config::load();
            assert!(config.is_ok(), "Config::load() failed: {:?}", config.err());
            let config = config.unwrap();
            assert_eq!(config.graphmem.log_level, "debug");
            assert_eq!(config.default_group_id(), "tenant-a");
            assert_eq!(config.backend.provider, "openai");
            assert_eq!(config.search.default_limit, 5);
            assert_eq!(config.backend_api_key().as_deref(), Some("test-key"));
        });
    }

    #[test]
    fn test_config_defaults_for_missing_sections() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "[graphmem]\ndb_path = \"./g.db\"\n").unwrap();
        let config_path = config_path.canonicalize().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        let _cwd = CwdGuard(original_dir.clone());
        std::env::set_current_dir(temp_dir.path()).unwrap();
        with_config_env(&config_path, None, || {
            let config = Config::load().unwrap();
            assert_eq!(config.backend.provider, "local");
            assert_eq!(config.embeddings.provider, "fallback");
            assert_eq!(config.embeddings.dimensions, 384);
            assert_eq!(config.search.default_limit, 10);
            assert_eq!(config.default_group_id(), "default");
        });
    }

    #[test]
    fn test_config_missing_api_key_is_not_fatal() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, create_test_config()).unwrap();
        let config_path = config_path.canonicalize().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        let _cwd = CwdGuard(original_dir.clone());
        std::env::set_current_dir(temp_dir.path()).unwrap();
        with_config_env(&config_path, None, || {
            let config = Config::load();
            assert!(config.is_ok(), "missing key must not fail validation");
            assert!(config.unwrap().backend_api_key().is_none());
        });
    }

    #[test]
    fn test_config_rejects_wrong_dimensions() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let toml = create_test_config().replace("dimensions = 384", "dimensions = 1536");
        fs::write(&config_path, toml).unwrap();
        let config_path = config_path.canonicalize().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        let _cwd = CwdGuard(original_dir.clone());
        std::env::set_current_dir(temp_dir.path()).unwrap();
        with_config_env(&config_path, Some("test-key"), || {
            let config = Config::load();
            assert!(config.is_err());
            assert!(config.unwrap_err().to_string().contains("dimensions"));
        });
    }

    #[test]
    fn test_config_rejects_zero_limits() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        let _cwd = CwdGuard(original_dir.clone());
        std::env::set_current_dir(temp_dir.path()).unwrap();

        for (field, bad, expected) in [
            ("default_limit = 5", "default_limit = 0", "default_limit"),
            ("cache_capacity = 64", "cache_capacity = 0", "cache_capacity"),
            ("batch_size = 100", "batch_size = 0", "batch_size"),
        ] {
            let config_path = temp_dir.path().join(format!("{}.toml", expected));
            fs::write(&config_path, create_test_config().replace(field, bad)).unwrap();
            let config_path = config_path.canonicalize().unwrap();
            with_config_env(&config_path, Some("test-key"), || {
                let config = Config::load();
                assert!(config.is_err(), "{} = 0 must fail validation", expected);
                assert!(config.unwrap_err().to_string().contains(expected));
            });
        }
    }

    #[test]
    fn test_config_rejects_unknown_provider() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let toml = create_test_config().replace("provider = \"openai\"", "provider = \"llama-rpc\"");
        fs::write(&config_path, toml).unwrap();
        let config_path = config_path.canonicalize().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        let _cwd = CwdGuard(original_dir.clone());
        std::env::set_current_dir(temp_dir.path()).unwrap();
        with_config_env(&config_path, Some("test-key"), || {
            let config = Config::load();
            assert!(config.is_err());
            assert!(config.unwrap_err().to_string().contains("backend.provider"));
        });
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let original = std::env::var("GRAPHMEM_CONFIG").ok();
        std::env::set_var("GRAPHMEM_CONFIG", "nonexistent.toml");
        let config = Config::load();
        assert!(config.is_err());
        std::env::remove_var("GRAPHMEM_CONFIG");
        if let Some(v) = original {
            std::env::set_var("GRAPHMEM_CONFIG", v);
        }
    }
}
