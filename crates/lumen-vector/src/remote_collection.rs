//! Remote collection store speaking the Qdrant REST API.
//!
//! Qdrant point ids must be integers or UUIDs, so string record ids are
//! mapped to UUIDv5 and the original id travels in the payload under
//! [`ID_FIELD`].
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use lumen_core::config::{BackendConfig, Metric};
use lumen_core::traits::VectorIndexBackend;
use lumen_core::types::{sort_ranked, HealthStatus, IndexStats, Metadata, RankedResult, SearchOptions, VectorRecord};
use lumen_core::{Error, Result};

use crate::backend::{check_query_vector, check_records, require};
use crate::rest::RestClient;
use crate::score::normalize;

const PROVIDER: &str = "remote-collection";
pub const ID_FIELD: &str = "_lumen_id";

pub struct RemoteCollection {
    config: BackendConfig,
    client: Option<RestClient>,
    last_updated: RwLock<Option<DateTime<Utc>>>,
}

#[derive(Serialize)]
struct Point<'a> {
    id: Uuid,
    vector: &'a [f32],
    payload: Metadata,
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
pub(crate) struct ScoredPoint {
    #[serde(default)]
    pub(crate) score: f32,
    #[serde(default)]
    pub(crate) payload: Option<Metadata>,
}

#[derive(Deserialize)]
struct CollectionInfo {
    #[serde(default)]
    points_count: Option<usize>,
    config: CollectionConfig,
}

#[derive(Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Deserialize)]
struct VectorParams {
    size: usize,
}

pub fn point_id(record_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, record_id.as_bytes())
}

fn distance_name(metric: Metric) -> &'static str {
    match metric {
        Metric::Cosine => "Cosine",
        Metric::Euclidean => "Euclid",
        Metric::Dot => "Dot",
    }
}

/// Qdrant `filter.must` clauses for metadata equality.
fn equality_filter(filter: &Metadata) -> Value {
    let must: Vec<Value> = filter.iter().map(|(k, v)| json!({"key": k, "match": {"value": v}})).collect();
    json!({ "must": must })
}

/// Convert search hits into ranked results; hits without an id are dropped.
pub(crate) fn to_ranked(points: Vec<ScoredPoint>, metric: Metric, options: &SearchOptions) -> Vec<RankedResult> {
    let mut out: Vec<RankedResult> = points
        .into_iter()
        .filter_map(|p| {
            let mut payload = p.payload.unwrap_or_default();
            let id = match payload.remove(ID_FIELD) {
                Some(Value::String(id)) => id,
                _ => return None,
            };
            let score = normalize(metric, p.score);
            if options.threshold.is_some_and(|t| score < t) {
                return None;
            }
            let metadata = if options.include_metadata { payload } else { Metadata::new() };
            Some(RankedResult::from_similarity(id, score, metadata))
        })
        .collect();
    sort_ranked(&mut out);
    out.truncate(options.top_k);
    out
}

impl RemoteCollection {
    pub fn new(config: BackendConfig) -> Self {
        Self { config, client: None, last_updated: RwLock::new(None) }
    }

    fn client(&self) -> Result<&RestClient> {
        self.client.as_ref().ok_or_else(|| Error::backend(PROVIDER, "collection is not initialized"))
    }

    fn path(&self, suffix: &str) -> String {
        format!("/collections/{}{}", self.config.index_name, suffix)
    }

    fn touch(&self) {
        *self.last_updated.write() = Some(Utc::now());
    }

    async fn collection_info(&self) -> Result<Option<CollectionInfo>> {
        let info: Option<Envelope<CollectionInfo>> = self.client()?.get_opt(&self.path("")).await?;
        Ok(info.map(|e| e.result))
    }

    async fn ensure_collection(&self) -> Result<()> {
        match self.collection_info().await? {
            Some(info) if info.config.params.vectors.size != self.config.dimension => Err(Error::InvalidConfig(format!(
                "{PROVIDER}: collection '{}' has dimension {}, configured {}",
                self.config.index_name, info.config.params.vectors.size, self.config.dimension
            ))),
            Some(_) => Ok(()),
            None if self.config.create_if_missing => {
                let body = json!({
                    "vectors": { "size": self.config.dimension, "distance": distance_name(self.config.metric) }
                });
                let _: Value = self.client()?.send(Method::PUT, &self.path(""), &body).await?;
                debug!(collection = %self.config.index_name, "created collection");
                Ok(())
            }
            None => Err(Error::InvalidConfig(format!(
                "{PROVIDER}: collection '{}' does not exist",
                self.config.index_name
            ))),
        }
    }
}

#[async_trait]
impl VectorIndexBackend for RemoteCollection {
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
        let base = require(PROVIDER, "connection_string", self.config.connection_string.as_ref())?;
        let auth = self.config.api_key.clone().map(|k| ("api-key", k));
        self.client = Some(RestClient::new(PROVIDER, base, auth, self.config.request_timeout())?);
        self.ensure_collection().await
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let client = self.client()?;
        check_records(records, self.config.dimension)?;
        let mut failed_ids = Vec::new();
        let mut last_error = String::new();
        for batch in records.chunks(self.config.batch_size.max(1)) {
            let points: Vec<Point<'_>> = batch
                .iter()
                .map(|r| {
                    let mut payload = r.metadata.clone();
                    payload.insert(ID_FIELD.to_string(), Value::String(r.id.clone()));
                    Point { id: point_id(&r.id), vector: &r.vector, payload }
                })
                .collect();
            let res: Result<Value> =
                client.send(Method::PUT, &self.path("/points?wait=true"), &json!({ "points": points })).await;
            if let Err(e) = res {
                warn!(provider = PROVIDER, batch = batch.len(), error = %e, "upsert batch failed");
                failed_ids.extend(batch.iter().map(|r| r.id.clone()));
                last_error = e.to_string();
            }
        }
        if failed_ids.len() < records.len() {
            self.touch();
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
            "limit": options.top_k,
            "with_payload": true,
        });
        if let Some(filter) = options.filter.as_ref().filter(|f| !f.is_empty()) {
            body["filter"] = equality_filter(filter);
        }
        let resp: Envelope<Vec<ScoredPoint>> =
            client.send(Method::POST, &self.path("/points/search"), &body).await?;
        Ok(to_ranked(resp.result, self.config.metric, options))
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let client = self.client()?;
        if ids.is_empty() {
            return Ok(());
        }
        let points: Vec<Uuid> = ids.iter().map(|id| point_id(id)).collect();
        let _: Value = client.send(Method::POST, &self.path("/points/delete?wait=true"), &json!({ "points": points })).await?;
        self.touch();
        Ok(())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let info = self
            .collection_info()
            .await?
            .ok_or_else(|| Error::NotFound(format!("collection '{}'", self.config.index_name)))?;
        Ok(IndexStats {
            total_vectors: info.points_count.unwrap_or(0),
            dimension: info.config.params.vectors.size,
            index_type: PROVIDER.to_string(),
            last_updated: *self.last_updated.read(),
        })
    }

    async fn health_check(&self) -> HealthStatus {
        match self.collection_info().await {
            Ok(Some(info)) => HealthStatus::healthy(format!("{} points", info.points_count.unwrap_or(0))),
            Ok(None) => HealthStatus::unhealthy(format!("collection '{}' not found", self.config.index_name)),
            Err(e) => HealthStatus::unhealthy(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_stable() {
        assert_eq!(point_id("doc-1"), point_id("doc-1"));
        assert_ne!(point_id("doc-1"), point_id("doc-2"));
    }

    #[test]
    fn search_hits_are_normalized_and_ordered() {
        let points: Vec<ScoredPoint> = serde_json::from_value(json!([
            {"id": "x", "score": 3.0, "payload": {"_lumen_id": "b", "title": "B"}},
            {"id": "y", "score": 0.0, "payload": {"_lumen_id": "a"}},
            {"id": "z", "score": 1.0, "payload": {"title": "no id"}}
        ]))
        .unwrap();
        let out = to_ranked(points, Metric::Euclidean, &SearchOptions::top_k(5));
        let ids: Vec<&str> = out.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(out[0].vector_score, 1.0);
        assert!((out[1].vector_score - 0.25).abs() < 1e-6);
        assert!(!out[1].metadata.contains_key(ID_FIELD));
    }

    #[test]
    fn equality_filter_uses_must_clauses() {
        let mut f = Metadata::new();
        f.insert("lang".into(), json!("en"));
        let v = equality_filter(&f);
        assert_eq!(v["must"][0]["key"], "lang");
        assert_eq!(v["must"][0]["match"]["value"], "en");
    }
}
