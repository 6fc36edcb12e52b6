//! lumen-hybrid
//!
//! `VectorSearchEngine`: semantic search over a [`VectorIndexBackend`] with
//! metadata and recency ranking factors, and hybrid search fusing it with the
//! keyword index.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use lumen_core::config::EngineConfig;
use lumen_core::traits::{EmbeddingClient, VectorIndexBackend, VectorSearch};
use lumen_core::types::{HealthStatus, HybridSearchOptions, IndexStats, Metadata, RankedResult, SearchOptions, VectorRecord};
use lumen_core::{Error, Result};
use lumen_text::{KeywordDoc, KeywordHit, KeywordIndex};

pub mod ranking;

/// Metadata fields consulted, in order, for the text fed to the keyword index.
pub const TEXT_FIELDS: [&str; 4] = ["content", "text", "excerpt", "title"];

#[derive(Default)]
struct Counters {
    semantic: AtomicU64,
    hybrid: AtomicU64,
    keyword: AtomicU64,
    embedding_failures: AtomicU64,
    backend_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub index: IndexStats,
    pub keyword_documents: usize,
    pub semantic_searches: u64,
    pub hybrid_searches: u64,
    pub keyword_searches: u64,
    pub embedding_failures: u64,
    pub backend_failures: u64,
}

/// A document to embed and index in one step.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
}

pub struct VectorSearchEngine {
    backend: Arc<dyn VectorIndexBackend>,
    embedder: Option<Arc<dyn EmbeddingClient>>,
    keyword: KeywordIndex,
    config: EngineConfig,
    counters: Counters,
}

fn keyword_text(metadata: &Metadata) -> Option<&str> {
    TEXT_FIELDS.iter().find_map(|f| metadata.get(*f).and_then(Value::as_str))
}

impl VectorSearchEngine {
    pub fn new(
        backend: Arc<dyn VectorIndexBackend>,
        embedder: Option<Arc<dyn EmbeddingClient>>,
        config: EngineConfig,
    ) -> Result<Self> {
        if let Some(e) = &embedder {
            if e.dimension() != backend.dimension() {
                return Err(Error::InvalidConfig(format!(
                    "embedding model '{}' produces dimension {}, index expects {}",
                    e.model_id(),
                    e.dimension(),
                    backend.dimension()
                )));
            }
        }
        let keyword = KeywordIndex::new(config.exact_match_boost)?;
        Ok(Self { backend, embedder, keyword, config, counters: Counters::default() })
    }

    pub fn backend(&self) -> &Arc<dyn VectorIndexBackend> {
        &self.backend
    }

    /// Write-through to the vector backend and the keyword index. On a
    /// partial upsert the records the backend accepted are still indexed for
    /// keywords before the error is returned.
    pub async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let outcome = self.backend.upsert(records).await;
        let failed: &[String] = match &outcome {
            Ok(()) => &[],
            Err(Error::PartialUpsert { failed_ids, .. }) => failed_ids,
            Err(e) => return Err(e.clone()),
        };
        let docs: Vec<KeywordDoc> = records
            .iter()
            .filter(|r| !failed.contains(&r.id))
            .filter_map(|r| {
                keyword_text(&r.metadata).map(|text| KeywordDoc {
                    id: r.id.clone(),
                    text: text.to_string(),
                    metadata: r.metadata.clone(),
                })
            })
            .collect();
        self.keyword.upsert(&docs)?;
        debug!(records = records.len(), keyword_docs = docs.len(), "engine upsert");
        outcome
    }

    /// Embed `docs` and upsert them; the text is kept under `content` unless
    /// the metadata already carries one of [`TEXT_FIELDS`].
    pub async fn index_documents(&self, docs: &[Document]) -> Result<()> {
        let embedder = self.embedder.as_ref().ok_or(Error::EmbeddingUnavailable)?;
        let texts: Vec<String> = docs.iter().map(|d| d.text.clone()).collect();
        let vectors = embedder.embed_batch(&texts).await.map_err(|e| self.embedding_failed(e))?;
        let records: Vec<VectorRecord> = docs
            .iter()
            .zip(vectors)
            .map(|(d, vector)| {
                let mut metadata = d.metadata.clone();
                if keyword_text(&metadata).is_none() {
                    metadata.insert("content".into(), Value::String(d.text.clone()));
                }
                VectorRecord::new(d.id.clone(), vector).with_metadata(metadata)
            })
            .collect();
        self.upsert(&records).await
    }

    pub async fn delete(&self, ids: &[String]) -> Result<()> {
        self.backend.delete(ids).await?;
        self.keyword.delete(ids)
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let index = self.backend.stats().await?;
        let c = &self.counters;
        Ok(EngineStats {
            index,
            keyword_documents: self.keyword.len(),
            semantic_searches: c.semantic.load(Ordering::Relaxed),
            hybrid_searches: c.hybrid.load(Ordering::Relaxed),
            keyword_searches: c.keyword.load(Ordering::Relaxed),
            embedding_failures: c.embedding_failures.load(Ordering::Relaxed),
            backend_failures: c.backend_failures.load(Ordering::Relaxed),
        })
    }

    fn embedding_failed(&self, e: Error) -> Error {
        self.counters.embedding_failures.fetch_add(1, Ordering::Relaxed);
        warn!(error = %e, "query embedding failed");
        match e {
            Error::Embedding(_) | Error::EmbeddingUnavailable => e,
            other => Error::Embedding(other.to_string()),
        }
    }

    fn backend_failed(&self, e: Error) -> Error {
        self.counters.backend_failures.fetch_add(1, Ordering::Relaxed);
        warn!(provider = self.backend.provider(), error = %e, "vector search failed");
        e
    }

    pub async fn semantic_search(&self, query_text: &str, options: &SearchOptions) -> Result<Vec<RankedResult>> {
        options.validate()?;
        self.counters.semantic.fetch_add(1, Ordering::Relaxed);
        let embedder = self.embedder.as_ref().ok_or(Error::EmbeddingUnavailable)?;
        let vector = embedder.embed(query_text).await.map_err(|e| self.embedding_failed(e))?;
        let mut results = self.backend.search(&vector, options).await.map_err(|e| self.backend_failed(e))?;
        ranking::apply_factors(&mut results, query_text, &self.config, Utc::now());
        debug!(hits = results.len(), top_k = options.top_k, "semantic search");
        Ok(results)
    }

    fn keyword_search(&self, query_text: &str, limit: usize, options: &SearchOptions) -> Result<Vec<KeywordHit>> {
        self.counters.keyword.fetch_add(1, Ordering::Relaxed);
        let hits = self.keyword.search(query_text, limit).map_err(|e| self.backend_failed(e))?;
        Ok(hits.into_iter().filter(|h| options.admits(&h.metadata)).collect())
    }

    pub async fn hybrid_search(&self, query_text: &str, options: &HybridSearchOptions) -> Result<Vec<RankedResult>> {
        let (vector_weight, keyword_weight) = options.normalized_weights()?;
        options.search.validate()?;
        self.counters.hybrid.fetch_add(1, Ordering::Relaxed);
        if keyword_weight == 0.0 {
            return self.semantic_search(query_text, &options.search).await;
        }
        let candidates = options.search.top_k.saturating_mul(self.config.keyword_candidates_factor.max(1));
        if vector_weight == 0.0 {
            let keyword = self.keyword_search(query_text, candidates, &options.search)?;
            return Ok(ranking::fuse(Vec::new(), keyword, 0.0, 1.0, &options.search));
        }

        let semantic_options = SearchOptions { top_k: candidates, threshold: None, ..options.search.clone() };
        // The keyword side is a synchronous in-RAM tantivy search: it runs on
        // this task and cannot be interrupted by the caller's deadline.
        // TODO: move it onto spawn_blocking if the keyword index is ever
        // persisted to disk and searches stop being sub-millisecond.
        let (semantic, keyword) = tokio::join!(self.semantic_search(query_text, &semantic_options), async {
            self.keyword_search(query_text, candidates, &options.search)
        });
        let merged = ranking::fuse(semantic?, keyword?, vector_weight, keyword_weight, &options.search);
        debug!(hits = merged.len(), vector_weight, keyword_weight, "hybrid search");
        Ok(merged)
    }

    pub async fn health_check(&self) -> HealthStatus {
        let backend = self.backend.health_check().await;
        if backend.healthy && self.embedder.is_none() {
            return HealthStatus::unhealthy("embedding client is not configured");
        }
        backend
    }
}

#[async_trait]
impl VectorSearch for VectorSearchEngine {
    async fn semantic_search(&self, query_text: &str, options: &SearchOptions) -> Result<Vec<RankedResult>> {
        Self::semantic_search(self, query_text, options).await
    }

    async fn hybrid_search(&self, query_text: &str, options: &HybridSearchOptions) -> Result<Vec<RankedResult>> {
        Self::hybrid_search(self, query_text, options).await
    }

    async fn health_check(&self) -> HealthStatus {
        Self::health_check(self).await
    }
}
