use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use lumen_core::config::BackendConfig;
use lumen_core::traits::VectorIndexBackend;
use lumen_core::types::{sort_ranked, HealthStatus, IndexStats, RankedResult, SearchOptions, VectorRecord};
use lumen_core::{Error, Result};

use crate::backend::{check_query_vector, check_records, require};
use crate::score::similarity;

const PROVIDER: &str = "flat";

#[derive(Default)]
struct FlatState {
    records: BTreeMap<String, VectorRecord>,
    last_updated: Option<DateTime<Utc>>,
}

/// In-process brute-force index. Exact results, linear scan per query.
pub struct FlatIndex {
    config: BackendConfig,
    state: RwLock<FlatState>,
    initialized: bool,
}

impl FlatIndex {
    pub fn new(config: BackendConfig) -> Self {
        Self { config, state: RwLock::new(FlatState::default()), initialized: false }
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::backend(PROVIDER, "index is not initialized"))
        }
    }
}

#[async_trait]
impl VectorIndexBackend for FlatIndex {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn initialize(&mut self) -> Result<()> {
        if self.config.dimension == 0 {
            return Err(Error::InvalidConfig("flat: dimension must be greater than zero".into()));
        }
        require(PROVIDER, "index_name", Some(&self.config.index_name))?;
        self.initialized = true;
        debug!(index = %self.config.index_name, dimension = self.config.dimension, "flat index initialized");
        Ok(())
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        self.ensure_initialized()?;
        // Validate the whole batch before touching the map so a bad record
        // leaves the index unchanged.
        check_records(records, self.config.dimension)?;
        if records.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write();
        for r in records {
            state.records.insert(r.id.clone(), r.clone());
        }
        state.last_updated = Some(Utc::now());
        Ok(())
    }

    async fn search(&self, vector: &[f32], options: &SearchOptions) -> Result<Vec<RankedResult>> {
        self.ensure_initialized()?;
        options.validate()?;
        check_query_vector(vector, self.config.dimension)?;
        let state = self.state.read();
        let mut hits: Vec<RankedResult> = state
            .records
            .values()
            .filter(|r| options.admits(&r.metadata))
            .map(|r| (r, similarity(self.config.metric, vector, &r.vector)))
            .filter(|(_, score)| options.threshold.map_or(true, |t| *score >= t))
            .map(|(r, score)| {
                let metadata = if options.include_metadata { r.metadata.clone() } else { Default::default() };
                RankedResult::from_similarity(r.id.clone(), score, metadata)
            })
            .collect();
        sort_ranked(&mut hits);
        hits.truncate(options.top_k);
        Ok(hits)
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        self.ensure_initialized()?;
        let mut state = self.state.write();
        let before = state.records.len();
        for id in ids {
            state.records.remove(id);
        }
        if state.records.len() != before {
            state.last_updated = Some(Utc::now());
        }
        Ok(())
    }

    async fn stats(&self) -> Result<IndexStats> {
        self.ensure_initialized()?;
        let state = self.state.read();
        Ok(IndexStats {
            total_vectors: state.records.len(),
            dimension: self.config.dimension,
            index_type: PROVIDER.to_string(),
            last_updated: state.last_updated,
        })
    }

    async fn health_check(&self) -> HealthStatus {
        if self.initialized {
            HealthStatus::healthy(format!("{} vectors in memory", self.len()))
        } else {
            HealthStatus::unhealthy("flat index is not initialized")
        }
    }
}
