//! Configuration management for Omnibox
//!
//! All runtime behavior is driven by environment variables; there is no
//! compile-time configuration. `Config::from_env` reads the environment with
//! sensible defaults, and `validate()` checks cross-field invariants before
//! the server starts.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// LLM provider settings
    #[serde(default)]
    pub llm: LlmConfig,
    /// Embedding model settings
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Feed service endpoints
    #[serde(default)]
    pub feed: FeedConfig,
    /// Per-call timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Cache TTLs and bounds
    #[serde(default)]
    pub cache: CacheConfig,
    /// Paths for persisted state
    #[serde(default)]
    pub storage: StorageConfig,
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Whether the research subsystem is enabled at boot
    #[serde(default = "default_research_enabled")]
    pub research_enabled: bool,
}

fn default_research_enabled() -> bool {
    true
}

/// Configuration for the LLM provider.
///
/// The pipeline is provider-agnostic: any chat-completion API with JSON-mode
/// output works, and swapping providers only requires changing these values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name (e.g., "openai", "openrouter", "deepseek")
    pub provider: String,
    /// API key for the provider
    pub api_key: Option<String>,
    /// Base URL for the provider API
    pub base_url: String,
    /// Model identifier
    pub model: String,
    /// Sampling temperature for extraction calls
    pub temperature: f32,
}

/// Embedding model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model identifier understood by the embedding backend
    pub model: String,
    /// Directory where model artifacts are cached
    pub cache_dir: PathBuf,
}

/// Backend feed service endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Primary base URL
    pub primary_base: String,
    /// Fallback base URL used when the primary is unhealthy
    pub fallback_base: String,
    /// Retries against each base before failing over
    pub max_retries: usize,
}

/// Bounded timeouts for external calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// LLM completion timeout (seconds)
    pub llm_secs: u64,
    /// Feed fetch timeout (seconds)
    pub fetch_secs: u64,
    /// Health-check probe timeout (seconds)
    pub health_secs: u64,
}

/// Cache TTLs and capacity bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for cached LLM completions (seconds)
    pub completion_ttl_secs: u64,
    /// TTL for cached entity resolutions (seconds)
    pub resolution_ttl_secs: u64,
    /// TTL for cached fetched payloads (seconds)
    pub payload_ttl_secs: u64,
    /// Maximum entries per cache namespace
    pub max_entries: usize,
}

/// Paths for persisted state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Raw catalog file consumed by the enrichment step
    pub catalog_path: PathBuf,
    /// Enriched catalog artifact written by re-indexing
    pub enriched_catalog_path: PathBuf,
    /// Directory holding vector-store collections
    pub vector_dir: PathBuf,
    /// SQLite database URL for subscriptions and task records
    pub database_url: String,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address, e.g. "127.0.0.1:8350"
    pub bind_addr: String,
    /// Path advertised to clients for streaming attachment
    pub websocket_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            feed: FeedConfig::default(),
            timeouts: TimeoutConfig::default(),
            cache: CacheConfig::default(),
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
            research_enabled: true,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "multilingual-e5-small".to_string(),
            cache_dir: PathBuf::from("data/models"),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            primary_base: "http://localhost:1200".to_string(),
            fallback_base: "https://rsshub.app".to_string(),
            max_retries: 2,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            llm_secs: 60,
            fetch_secs: 30,
            health_secs: 3,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            completion_ttl_secs: 2 * 60 * 60,
            resolution_ttl_secs: 15 * 60,
            payload_ttl_secs: 5 * 60,
            max_entries: 1024,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("data/catalog.json"),
            enriched_catalog_path: PathBuf::from("data/catalog.enriched.json"),
            vector_dir: PathBuf::from("data/vectors"),
            database_url: "sqlite://data/omnibox.db".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8350".to_string(),
            websocket_path: "/ws".to_string(),
        }
    }
}

impl TimeoutConfig {
    pub fn llm(&self) -> Duration {
        Duration::from_secs(self.llm_secs)
    }

    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch_secs)
    }

    pub fn health(&self) -> Duration {
        Duration::from_secs(self.health_secs)
    }
}

/// Read an environment variable, falling back to the provided default.
fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read and parse an environment variable, falling back on absence or
/// unparseable values.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Build configuration from environment variables, applying defaults for
    /// anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            llm: LlmConfig {
                provider: env_or("OMNIBOX_LLM_PROVIDER", &defaults.llm.provider),
                api_key: env::var("OMNIBOX_LLM_API_KEY").ok(),
                base_url: env_or("OMNIBOX_LLM_BASE_URL", &defaults.llm.base_url),
                model: env_or("OMNIBOX_LLM_MODEL", &defaults.llm.model),
                temperature: env_parse("OMNIBOX_LLM_TEMPERATURE", defaults.llm.temperature),
            },
            embedding: EmbeddingConfig {
                model: env_or("OMNIBOX_EMBEDDING_MODEL", &defaults.embedding.model),
                cache_dir: PathBuf::from(env_or(
                    "OMNIBOX_EMBEDDING_CACHE_DIR",
                    &defaults.embedding.cache_dir.to_string_lossy(),
                )),
            },
            feed: FeedConfig {
                primary_base: env_or("OMNIBOX_FEED_PRIMARY", &defaults.feed.primary_base),
                fallback_base: env_or("OMNIBOX_FEED_FALLBACK", &defaults.feed.fallback_base),
                max_retries: env_parse("OMNIBOX_FEED_MAX_RETRIES", defaults.feed.max_retries),
            },
            timeouts: TimeoutConfig {
                llm_secs: env_parse("OMNIBOX_TIMEOUT_LLM_SECS", defaults.timeouts.llm_secs),
                fetch_secs: env_parse("OMNIBOX_TIMEOUT_FETCH_SECS", defaults.timeouts.fetch_secs),
                health_secs: env_parse(
                    "OMNIBOX_TIMEOUT_HEALTH_SECS",
                    defaults.timeouts.health_secs,
                ),
            },
            cache: CacheConfig {
                completion_ttl_secs: env_parse(
                    "OMNIBOX_CACHE_COMPLETION_TTL",
                    defaults.cache.completion_ttl_secs,
                ),
                resolution_ttl_secs: env_parse(
                    "OMNIBOX_CACHE_RESOLUTION_TTL",
                    defaults.cache.resolution_ttl_secs,
                ),
                payload_ttl_secs: env_parse(
                    "OMNIBOX_CACHE_PAYLOAD_TTL",
                    defaults.cache.payload_ttl_secs,
                ),
                max_entries: env_parse("OMNIBOX_CACHE_MAX_ENTRIES", defaults.cache.max_entries),
            },
            storage: StorageConfig {
                catalog_path: PathBuf::from(env_or(
                    "OMNIBOX_CATALOG_PATH",
                    &defaults.storage.catalog_path.to_string_lossy(),
                )),
                enriched_catalog_path: PathBuf::from(env_or(
                    "OMNIBOX_ENRICHED_CATALOG_PATH",
                    &defaults.storage.enriched_catalog_path.to_string_lossy(),
                )),
                vector_dir: PathBuf::from(env_or(
                    "OMNIBOX_VECTOR_DIR",
                    &defaults.storage.vector_dir.to_string_lossy(),
                )),
                database_url: env_or("OMNIBOX_DATABASE_URL", &defaults.storage.database_url),
            },
            server: ServerConfig {
                bind_addr: env_or("OMNIBOX_BIND_ADDR", &defaults.server.bind_addr),
                websocket_path: env_or("OMNIBOX_WS_PATH", &defaults.server.websocket_path),
            },
            research_enabled: env_parse("OMNIBOX_RESEARCH_ENABLED", defaults.research_enabled),
        }
    }

    /// Load configuration from a TOML file. Missing sections fall back to
    /// their defaults; the environment is not consulted.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError { source: e })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError { source: e })
    }

    /// Resolve configuration: an explicit file wins over the environment.
    pub fn load(file: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        match file {
            Some(path) if path.exists() => Self::from_file(path),
            Some(path) => Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }),
            None => Ok(Self::from_env()),
        }
    }

    /// Check that the configuration is internally consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.llm.api_key.is_none() {
            return Err(ConfigError::MissingKey {
                key: "OMNIBOX_LLM_API_KEY".to_string(),
            });
        }
        for (key, value) in [
            ("OMNIBOX_FEED_PRIMARY", &self.feed.primary_base),
            ("OMNIBOX_FEED_FALLBACK", &self.feed.fallback_base),
            ("OMNIBOX_LLM_BASE_URL", &self.llm.base_url),
        ] {
            if url::Url::parse(value).is_err() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.clone(),
                });
            }
        }
        if self.timeouts.llm_secs == 0 || self.timeouts.fetch_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "OMNIBOX_TIMEOUT_*".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}
