//! Configuration loader and typed configuration sections.
//!
//! Uses Figment to merge `config.toml` + `config.<env>.toml` + `APP_*` env vars
//! (`__` separates nested keys, e.g. `APP_PROCESSOR__MAX_CONCURRENT_QUERIES`).
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from_dir(Path::new("."))
    }

    /// Load `config.toml` and the environment overlay from `dir`.
    pub fn load_from_dir(dir: &Path) -> anyhow::Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::new().merge(Toml::file(dir.join("config.toml")));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file(dir.join("config.dev.toml"))),
            "prod" | "production" => figment = figment.merge(Toml::file(dir.join("config.prod.toml"))),
            "test" | "testing" => figment = figment.merge(Toml::file(dir.join("config.test.toml"))),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));

        let config = Self { figment };
        config.validate_for_env(&env_name)?;
        Ok(config)
    }

    pub fn get<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| anyhow::anyhow!("Failed to get '{}': {}", key, e))
    }

    /// Every section, with defaults for anything not configured.
    pub fn app(&self) -> anyhow::Result<AppConfig> {
        self.figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to extract configuration: {}", e))
    }

    fn validate_for_env(&self, env: &str) -> anyhow::Result<()> {
        if matches!(env, "prod" | "production") {
            let app = self.app()?;
            if app.embedding.provider == EmbeddingProvider::Hash {
                anyhow::bail!("embedding.provider = \"hash\" is not allowed in production");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub vector: BackendConfig,
    pub engine: EngineConfig,
    pub processor: ProcessorConfig,
    pub cache: CacheConfig,
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    /// In-process brute-force index.
    Flat,
    /// Remote collection-based store (Qdrant REST).
    RemoteCollection,
    /// Remote managed index service (Pinecone REST).
    Managed,
}

/// Native score semantics of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cosine,
    Euclidean,
    Dot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub provider: Provider,
    pub dimension: usize,
    pub index_name: String,
    pub connection_string: Option<String>,
    pub api_key: Option<String>,
    pub environment: Option<String>,
    pub namespace: Option<String>,
    pub metric: Metric,
    pub batch_size: usize,
    pub request_timeout_ms: u64,
    pub create_if_missing: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Flat,
            dimension: 384,
            index_name: "documents".to_string(),
            connection_string: None,
            api_key: None,
            environment: None,
            namespace: None,
            metric: Metric::Cosine,
            batch_size: 100,
            request_timeout_ms: 5_000,
            create_if_missing: true,
        }
    }
}

impl BackendConfig {
    pub fn flat(dimension: usize) -> Self {
        Self { dimension, ..Self::default() }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub metadata_bonus_max: f32,
    pub recency_bonus_max: f32,
    pub recency_half_life_days: f64,
    /// Keyword candidates fetched per requested result before merging.
    pub keyword_candidates_factor: usize,
    pub exact_match_boost: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            metadata_bonus_max: 0.15,
            recency_bonus_max: 0.1,
            recency_half_life_days: 30.0,
            keyword_candidates_factor: 2,
            exact_match_boost: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub source_bonus: f32,
    pub max_source_bonus_count: usize,
    pub short_content_chars: usize,
    pub short_content_penalty: f32,
    pub low_relevance_threshold: f32,
    pub low_relevance_penalty: f32,
    pub volume_bonus: f32,
    pub volume_chars: usize,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            source_bonus: 0.05,
            max_source_bonus_count: 3,
            short_content_chars: 100,
            short_content_penalty: 0.1,
            low_relevance_threshold: 0.3,
            low_relevance_penalty: 0.1,
            volume_bonus: 0.05,
            volume_chars: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub max_concurrent_queries: usize,
    pub default_timeout_ms: u64,
    pub enable_parallel_search: bool,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub min_confidence_threshold: f32,
    pub max_results_per_source: usize,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub coalesce_identical: bool,
    /// How long a finished `submit` outcome waits for `take_result`.
    pub task_retention_secs: u64,
    pub vector_source_id: String,
    pub vector_source_name: String,
    pub confidence: ConfidenceConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: 10,
            default_timeout_ms: 2_000,
            enable_parallel_search: true,
            cache_enabled: true,
            cache_ttl_secs: 300,
            min_confidence_threshold: 0.1,
            max_results_per_source: 10,
            vector_weight: 0.7,
            keyword_weight: 0.3,
            coalesce_identical: true,
            task_retention_secs: 600,
            vector_source_id: "vector-index".to_string(),
            vector_source_name: "Vector Index".to_string(),
            confidence: ConfidenceConfig::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 1_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Deterministic token hashing; tests and offline development.
    Hash,
    /// OpenAI-compatible `/embeddings` endpoint.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub dimension: usize,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hash,
            dimension: 384,
            endpoint: None,
            api_key: None,
            model: "text-embedding-3-small".to_string(),
            request_timeout_ms: 5_000,
        }
    }
}
