//! Managed index service speaking the Pinecone data-plane REST API.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use lumen_core::config::{BackendConfig, Metric};
use lumen_core::traits::VectorIndexBackend;
use lumen_core::types::{sort_ranked, HealthStatus, IndexStats, Metadata, RankedResult, SearchOptions, VectorRecord};
use lumen_core::{Error, Result};

use crate::backend::{check_query_vector, check_records, require};
use crate::rest::RestClient;
use crate::score::normalize;

const PROVIDER: &str = "managed";

pub struct ManagedIndex {
    config: BackendConfig,
    client: Option<RestClient>,
    last_updated: RwLock<Option<DateTime<Utc>>>,
}

#[derive(Serialize)]
struct UpsertVector<'a> {
    id: &'a str,
    values: &'a [f32],
    metadata: &'a Metadata,
}

#[derive(Deserialize)]
pub(crate) struct QueryResponse {
    #[serde(default)]
    pub(crate) matches: Vec<Match>,
}

#[derive(Deserialize)]
pub(crate) struct Match {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) score: f32,
    #[serde(default)]
    pub(crate) metadata: Option<Metadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeStats {
    #[serde(default)]
    dimension: usize,
    #[serde(default)]
    total_vector_count: usize,
}

/// Pinecone metadata filter for equality constraints (`{"field": {"$eq": v}}`).
fn equality_filter(filter: &Metadata) -> Value {
    Value::Object(filter.iter().map(|(k, v)| (k.clone(), json!({ "$eq": v }))).collect())
}

pub(crate) fn to_ranked(resp: QueryResponse, metric: Metric, options: &SearchOptions) -> Vec<RankedResult> {
    let mut out: Vec<RankedResult> = resp
        .matches
        .into_iter()
        .map(|m| {
            let metadata = if options.include_metadata { m.metadata.unwrap_or_default() } else { Metadata::new() };
            RankedResult::from_similarity(m.id, normalize(metric, m.score), metadata)
        })
        .filter(|r| options.threshold.map_or(true, |t| r.vector_score >= t))
        .collect();
    sort_ranked(&mut out);
    out.truncate(options.top_k);
    out
}

impl ManagedIndex {
    pub fn new(config: BackendConfig) -> Self {
        Self { config, client: None, last_updated: RwLock::new(None) }
    }

    /// Index host: the configured connection string, otherwise the legacy
    /// environment-scoped hostname.
    pub fn host(config: &BackendConfig) -> Result<String> {
        if let Some(conn) = config.connection_string.as_ref().filter(|c| !c.trim().is_empty()) {
            return Ok(conn.trim().to_string());
        }
        let env = require(PROVIDER, "environment", config.environment.as_ref())?;
        Ok(format!("https://{}.svc.{}.pinecone.io", config.index_name, env))
    }

    fn client(&self) -> Result<&RestClient> {
        self.client.as_ref().ok_or_else(|| Error::backend(PROVIDER, "index is not initialized"))
    }

    fn namespace(&self) -> &str {
        self.config.namespace.as_deref().unwrap_or("")
    }

    async fn describe(&self) -> Result<DescribeStats> {
        self.client()?.send(Method::POST, "/describe_index_stats", &json!({})).await
    }
}

#[async_trait]
impl VectorIndexBackend for ManagedIndex {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn initialize(&mut self) -> Result<()> {
        if self.config.dimension == 0 {
            return Err(Error::InvalidConfig(format!("{PROVIDER}: dimension must be greater than zero")));
        }
        require(PROVIDER, "index_name", Some(&self.config.index_name))?;
        let api_key = require(PROVIDER, "api_key", self.config.api_key.as_ref())?.to_string();
        require(PROVIDER, "environment", self.config.environment.as_ref())?;
        let host = Self::host(&self.config)?;
        self.client = Some(RestClient::new(PROVIDER, &host, Some(("Api-Key", api_key)), self.config.request_timeout())?);

        let stats = self.describe().await?;
        if stats.dimension != 0 && stats.dimension != self.config.dimension {
            return Err(Error::InvalidConfig(format!(
                "{PROVIDER}: index '{}' has dimension {}, configured {}",
                self.config.index_name, stats.dimension, self.config.dimension
            )));
        }
        debug!(host = %host, vectors = stats.total_vector_count, "managed index initialized");
        Ok(())
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let client = self.client()?;
        check_records(records, self.config.dimension)?;
        let mut failed_ids = Vec::new();
        let mut last_error = String::new();
        for batch in records.chunks(self.config.batch_size.max(1)) {
            let vectors: Vec<UpsertVector<'_>> = batch
                .iter()
                .map(|r| UpsertVector { id: &r.id, values: &r.vector, metadata: &r.metadata })
                .collect();
            let body = json!({ "vectors": vectors, "namespace": self.namespace() });
            let res: Result<Value> = client.send(Method::POST, "/vectors/upsert", &body).await;
            if let Err(e) = res {
                warn!(provider = PROVIDER, batch = batch.len(), error = %e, "upsert batch failed");
                failed_ids.extend(batch.iter().map(|r| r.id.clone()));
                last_error = e.to_string();
            }
        }
        if failed_ids.len() < records.len() {
            *self.last_updated.write() = Some(Utc::now());
        }
        if failed_ids.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialUpsert { provider: PROVIDER.to_string(), failed_ids, message: last_error })
        }
    }

    async fn search(&self, vector: &[f32], options: &SearchOptions) -> Result<Vec<RankedResult>> {
        let client = self.client()?;
        options.validate()?;
        check_query_vector(vector, self.config.dimension)?;
        let mut body = json!({
            "vector": vector,
            "topK": options.top_k,
            "includeMetadata": options.include_metadata,
            "includeValues": false,
            "namespace": self.namespace(),
        });
        if let Some(filter) = options.filter.as_ref().filter(|f| !f.is_empty()) {
            body["filter"] = equality_filter(filter);
        }
        let resp: QueryResponse = client.send(Method::POST, "/query", &body).await?;
        Ok(to_ranked(resp, self.config.metric, options))
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let client = self.client()?;
        if ids.is_empty() {
            return Ok(());
        }
        let body = json!({ "ids": ids, "namespace": self.namespace() });
        let _: Value = client.send(Method::POST, "/vectors/delete", &body).await?;
        *self.last_updated.write() = Some(Utc::now());
        Ok(())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let stats = self.describe().await?;
        Ok(IndexStats {
            total_vectors: stats.total_vector_count,
            dimension: if stats.dimension == 0 { self.config.dimension } else { stats.dimension },
            index_type: PROVIDER.to_string(),
            last_updated: *self.last_updated.read(),
        })
    }

    async fn health_check(&self) -> HealthStatus {
        match self.describe().await {
            Ok(stats) => HealthStatus::healthy(format!("{} vectors", stats.total_vector_count)),
            Err(e) => HealthStatus::unhealthy(e.to_string()),
        }
    }
}
