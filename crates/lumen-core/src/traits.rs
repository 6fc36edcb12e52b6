use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    CacheStats, HealthStatus, HybridSearchOptions, IndexStats, Query, QueryResult, RankedResult, SearchOptions,
    SearchResult, SourceSearchOptions, VectorRecord,
};

/// Text to fixed-dimension vector.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Stable identifier for the provider/model (e.g. `hash:xxh64:d384`).
    fn model_id(&self) -> &str;
    fn dimension(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }
}

/// Uniform contract over heterogeneous vector-index providers.
///
/// Scores returned by `search` are already normalized into `[0, 1]`
/// similarity space, higher is better.
#[async_trait]
pub trait VectorIndexBackend: Send + Sync {
    /// Provider label used in logs and errors.
    fn provider(&self) -> &'static str;
    fn dimension(&self) -> usize;
    /// Validates provider configuration; must succeed before any other call.
    async fn initialize(&mut self) -> Result<()>;
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()>;
    async fn search(&self, vector: &[f32], options: &SearchOptions) -> Result<Vec<RankedResult>>;
    async fn delete(&self, ids: &[String]) -> Result<()>;
    async fn stats(&self) -> Result<IndexStats>;
    async fn health_check(&self) -> HealthStatus;
}

/// The search surface the query processor fans out to.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn semantic_search(&self, query_text: &str, options: &SearchOptions) -> Result<Vec<RankedResult>>;
    async fn hybrid_search(&self, query_text: &str, options: &HybridSearchOptions) -> Result<Vec<RankedResult>>;
    async fn health_check(&self) -> HealthStatus;
}

/// Auxiliary (non-vector) data sources, owned by the connector layer.
#[async_trait]
pub trait DataSourceManager: Send + Sync {
    async fn search(&self, query: &Query, options: &SourceSearchOptions) -> Result<Vec<SearchResult>>;
    async fn check_health(&self, source_id: &str) -> Result<HealthStatus>;
}

/// Query-result cache keyed by query fingerprint.
#[async_trait]
pub trait QueryCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<QueryResult>;
    async fn set(&self, key: &str, value: QueryResult, ttl: Duration);
    fn stats(&self) -> CacheStats;
}
