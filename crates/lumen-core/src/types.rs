//! Domain types shared by the index backends, the search engine and the
//! query processor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::filter::Filter;

pub type RecordId = String;
pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub const MAX_QUERY_CHARS: usize = 10_000;

/// A stored embedding. `vector.len()` must equal the owning index's dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: RecordId,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl VectorRecord {
    pub fn new(id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self { id: id.into(), vector, metadata: Metadata::new() }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A natural-language query as received from the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: Uuid,
    pub text: String,
    #[serde(default)]
    pub context: Option<Metadata>,
    #[serde(default)]
    pub filters: Option<Vec<Filter>>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self { id: Uuid::new_v4(), text: text.into(), context: None, filters: None, user_id: None, timestamp: Utc::now() }
    }

    pub fn with_context(mut self, context: Metadata) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_filters(mut self, filters: Vec<Filter>) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn filters(&self) -> &[Filter] {
        self.filters.as_deref().unwrap_or(&[])
    }

    /// Shallow shape check; malformed filters are rejected here rather than
    /// deep inside a backend.
    pub fn validate(&self) -> Result<()> {
        let len = self.text.trim().chars().count();
        if len == 0 {
            return Err(Error::Validation("query text must not be empty".into()));
        }
        if len > MAX_QUERY_CHARS {
            return Err(Error::Validation(format!("query text exceeds {MAX_QUERY_CHARS} characters ({len})")));
        }
        self.filters().iter().try_for_each(Filter::validate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub top_k: usize,
    #[serde(default)]
    pub threshold: Option<f32>,
    #[serde(default = "default_true")]
    pub include_metadata: bool,
    /// Metadata equality constraints pushed down to the backend.
    #[serde(default)]
    pub filter: Option<Metadata>,
}

fn default_true() -> bool {
    true
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { top_k: 10, threshold: None, include_metadata: true, filter: None }
    }
}

impl SearchOptions {
    pub fn top_k(top_k: usize) -> Self {
        Self { top_k, ..Self::default() }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_filter(mut self, filter: Metadata) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(Error::Validation("top_k must be greater than zero".into()));
        }
        if let Some(t) = self.threshold {
            if !t.is_finite() {
                return Err(Error::Validation("threshold must be finite".into()));
            }
        }
        Ok(())
    }

    /// Whether `metadata` satisfies every equality constraint in `filter`.
    pub fn admits(&self, metadata: &Metadata) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |f| f.iter().all(|(k, v)| metadata.get(k) == Some(v)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridSearchOptions {
    #[serde(flatten)]
    pub search: SearchOptions,
    pub vector_weight: f32,
    pub keyword_weight: f32,
}

impl HybridSearchOptions {
    pub fn new(search: SearchOptions, vector_weight: f32, keyword_weight: f32) -> Self {
        Self { search, vector_weight, keyword_weight }
    }

    /// Weights scaled to sum to one.
    pub fn normalized_weights(&self) -> Result<(f32, f32)> {
        let (v, k) = (self.vector_weight, self.keyword_weight);
        if !v.is_finite() || !k.is_finite() || v < 0.0 || k < 0.0 {
            return Err(Error::Validation("hybrid weights must be finite and non-negative".into()));
        }
        let sum = v + k;
        if sum <= 0.0 {
            return Err(Error::Validation("at least one hybrid weight must be positive".into()));
        }
        Ok((v / sum, k / sum))
    }
}

/// Additive contributions composed into a final score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingFactors {
    pub semantic: f32,
    pub metadata: f32,
    pub recency: f32,
}

impl RankingFactors {
    pub fn final_score(&self) -> f32 {
        (self.semantic + self.metadata + self.recency).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    pub id: RecordId,
    pub vector_score: f32,
    pub keyword_score: Option<f32>,
    pub ranking_factors: RankingFactors,
    pub final_score: f32,
    pub metadata: Metadata,
}

impl RankedResult {
    /// A result straight from a backend: only the semantic factor is known.
    pub fn from_similarity(id: impl Into<String>, similarity: f32, metadata: Metadata) -> Self {
        let factors = RankingFactors { semantic: similarity, ..RankingFactors::default() };
        Self {
            id: id.into(),
            vector_score: similarity,
            keyword_score: None,
            final_score: factors.final_score(),
            ranking_factors: factors,
            metadata,
        }
    }
}

/// Orders by descending score, ties by ascending id.
pub fn sort_ranked(results: &mut [RankedResult]) {
    results.sort_by(|a, b| b.final_score.total_cmp(&a.final_score).then_with(|| a.id.cmp(&b.id)));
}

/// A source-attributed result as it leaves the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub content_id: String,
    pub source_id: String,
    pub source_name: String,
    pub title: String,
    pub excerpt: String,
    pub relevance_score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchFailure {
    pub branch: String,
    pub reason: String,
}

/// Some fan-out branches failed but a result was still produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFailure {
    pub failed_branches: Vec<BranchFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub id: Uuid,
    pub results: Vec<SearchResult>,
    pub confidence: f32,
    pub processing_time_ms: u64,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_failure: Option<PartialFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_vectors: usize,
    pub dimension: usize,
    pub index_type: String,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub details: String,
}

impl HealthStatus {
    pub fn healthy(details: impl Into<String>) -> Self {
        Self { healthy: true, details: details.into() }
    }

    pub fn unhealthy(details: impl Into<String>) -> Self {
        Self { healthy: false, details: details.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hit_rate: f64,
    pub total_keys: usize,
    pub evictions: u64,
    pub memory_usage: usize,
}

/// Options handed to the data-source manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSearchOptions {
    pub limit: usize,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

/// Rounds a relevance score to three decimal places.
pub fn round_score(score: f32) -> f32 {
    (score * 1000.0).round() / 1000.0
}
