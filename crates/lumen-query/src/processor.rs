//! Per-query orchestration.
//!
//! `process` walks a query through `Admitted → Searching → Merging` and ends in
//! one of `Cached | Completed | TimedOut | CapacityExceeded | Failed |
//! Cancelled`. Branch futures are never spawned: dropping the request drops
//! every outstanding embedding, backend and data-source call with it.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::error::Elapsed;
use tokio::time::{timeout_at, Instant as Deadline};
use tracing::{debug, info, warn};
use uuid::Uuid;

use lumen_core::config::ProcessorConfig;
use lumen_core::filter::{Filter, FilterOperator};
use lumen_core::traits::{DataSourceManager, QueryCache, VectorSearch};
use lumen_core::types::{
    BranchFailure, CacheStats, HealthStatus, HybridSearchOptions, Metadata, PartialFailure, Query, QueryResult,
    SearchOptions, SearchResult, SourceSearchOptions,
};
use lumen_core::{Error, Result};

use crate::admission::Admission;
use crate::cancel::CancelRegistry;
use crate::fingerprint::fingerprint;
use crate::merge::{confidence, from_ranked, merge};
use crate::tasks::{TaskStatus, TaskTable};

const VECTOR_BRANCH: &str = "vector";
const SOURCE_BRANCH: &str = "data-source";

type Computation = BoxFuture<'static, Result<QueryResult>>;
type BranchOutcome = std::result::Result<Result<Vec<SearchResult>>, Elapsed>;

/// Snapshot for the external health subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorHealth {
    pub backend: HealthStatus,
    pub cache: CacheStats,
    pub in_flight: usize,
    pub max_concurrent_queries: usize,
}

struct Inner {
    config: ProcessorConfig,
    search: Arc<dyn VectorSearch>,
    sources: Option<Arc<dyn DataSourceManager>>,
    cache: Arc<dyn QueryCache>,
    admission: Arc<Admission>,
    cancels: CancelRegistry,
    flights: Mutex<HashMap<String, Flight>>,
    next_flight: AtomicU64,
    tasks: TaskTable,
}

/// An in-flight computation other identical queries can join.
struct Flight {
    id: u64,
    deadline: Deadline,
    shared: WeakShared<Computation>,
}

/// Cheap to clone; clones share caches, gates and in-flight state.
#[derive(Clone)]
pub struct QueryProcessor {
    inner: Arc<Inner>,
}

/// Unregisters a query's cancellation handle when it finishes.
struct Registration {
    inner: Arc<Inner>,
    id: Uuid,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.inner.cancels.remove(&self.id);
    }
}

/// Removes a single-flight entry once its computation is done or dropped.
struct FlightGuard {
    inner: Arc<Inner>,
    key: String,
    flight_id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut flights = self.inner.flights.lock();
        if flights.get(&self.key).is_some_and(|f| f.id == self.flight_id) {
            flights.remove(&self.key);
        }
    }
}

#[derive(Default)]
struct Settled {
    branches: Vec<Vec<SearchResult>>,
    failures: Vec<BranchFailure>,
    timed_out: bool,
    embedding_error: Option<Error>,
}

impl Settled {
    fn record(&mut self, query_id: Uuid, branch: &str, outcome: BranchOutcome) {
        let reason = match outcome {
            Ok(Ok(results)) => {
                debug!(query_id = %query_id, branch, hits = results.len(), "branch finished");
                self.branches.push(results);
                return;
            }
            Ok(Err(e)) => {
                if branch == VECTOR_BRANCH && matches!(e, Error::Embedding(_) | Error::EmbeddingUnavailable) {
                    self.embedding_error = Some(e.clone());
                }
                e.to_string()
            }
            Err(_) => {
                self.timed_out = true;
                "deadline exceeded".to_string()
            }
        };
        warn!(query_id = %query_id, branch, reason = %reason, "branch failed");
        self.failures.push(BranchFailure { branch: branch.to_string(), reason });
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Equality filters the backend can apply natively. Every filter is still
/// re-checked during merge.
fn equality_pushdown(filters: &[Filter]) -> Option<Metadata> {
    let eq: Metadata = filters
        .iter()
        .filter(|f| f.operator == FilterOperator::Eq && !f.value.is_array() && !f.value.is_object())
        .map(|f| (f.field.clone(), f.value.clone()))
        .collect();
    (!eq.is_empty()).then_some(eq)
}

fn state_of(err: &Error) -> &'static str {
    match err {
        Error::Timeout(_) => "timed_out",
        Error::CapacityExceeded { .. } => "capacity_exceeded",
        Error::Cancelled => "cancelled",
        _ => "failed",
    }
}

impl Inner {
    async fn vector_branch(&self, query: &Query) -> Result<Vec<SearchResult>> {
        let cfg = &self.config;
        let mut options = SearchOptions::top_k(cfg.max_results_per_source.max(1));
        options.filter = equality_pushdown(query.filters());
        let ranked = if cfg.keyword_weight > 0.0 {
            let hybrid = HybridSearchOptions::new(options, cfg.vector_weight, cfg.keyword_weight);
            self.search.hybrid_search(&query.text, &hybrid).await?
        } else {
            self.search.semantic_search(&query.text, &options).await?
        };
        Ok(ranked.into_iter().map(|r| from_ranked(r, cfg)).collect())
    }

    async fn fan_out(&self, query: &Query, deadline: Deadline) -> (BranchOutcome, Option<BranchOutcome>) {
        let vector = timeout_at(deadline, self.vector_branch(query));
        let Some(sources) = &self.sources else {
            return (vector.await, None);
        };
        let options = SourceSearchOptions { limit: self.config.max_results_per_source, filters: query.filters().to_vec() };
        let source = timeout_at(deadline, sources.search(query, &options));
        if self.config.enable_parallel_search {
            let (v, s) = tokio::join!(vector, source);
            (v, Some(s))
        } else {
            let v = vector.await;
            let s = source.await;
            (v, Some(s))
        }
    }

    /// One admitted computation: fan out, merge, score and store.
    async fn compute(self: Arc<Self>, key: String, query: Query, deadline: Deadline) -> Result<QueryResult> {
        let started = Instant::now();
        let cfg = &self.config;
        let _permit = self.admission.try_acquire()?;
        debug!(query_id = %query.id, in_flight = self.admission.in_flight(), state = "admitted", "query admitted");

        debug!(query_id = %query.id, state = "searching", "fan-out started");
        let (vector, source) = self.fan_out(&query, deadline).await;
        let mut settled = Settled::default();
        settled.record(query.id, VECTOR_BRANCH, vector);
        if let Some(source) = source {
            settled.record(query.id, SOURCE_BRANCH, source);
        }

        if settled.branches.is_empty() {
            if settled.timed_out {
                return Err(Error::Timeout(cfg.default_timeout()));
            }
            if let Some(e) = settled.embedding_error {
                return Err(e);
            }
            let message =
                settled.failures.iter().map(|f| format!("{}: {}", f.branch, f.reason)).collect::<Vec<_>>().join("; ");
            return Err(Error::backend("query", message));
        }

        debug!(query_id = %query.id, state = "merging", "merging branch results");
        let results = merge(settled.branches, query.filters(), cfg);
        let partial_failure = if settled.failures.is_empty() {
            None
        } else {
            warn!(query_id = %query.id, failed = settled.failures.len(), "partial failure");
            Some(PartialFailure { failed_branches: settled.failures })
        };
        let result = QueryResult {
            id: query.id,
            confidence: confidence(&results, &cfg.confidence),
            results,
            processing_time_ms: elapsed_ms(started),
            cached: false,
            partial_failure,
        };

        if cfg.cache_enabled && !result.results.is_empty() && Deadline::now() < deadline {
            if timeout_at(deadline, self.cache.set(&key, result.clone(), cfg.cache_ttl())).await.is_err() {
                debug!(query_id = %query.id, "cache store abandoned at deadline");
            }
        }
        Ok(result)
    }
}

impl QueryProcessor {
    pub fn new(
        config: ProcessorConfig,
        search: Arc<dyn VectorSearch>,
        sources: Option<Arc<dyn DataSourceManager>>,
        cache: Arc<dyn QueryCache>,
    ) -> Result<Self> {
        if config.max_concurrent_queries == 0 {
            return Err(Error::InvalidConfig("processor.max_concurrent_queries must be greater than zero".into()));
        }
        if config.default_timeout_ms == 0 {
            return Err(Error::InvalidConfig("processor.default_timeout_ms must be greater than zero".into()));
        }
        HybridSearchOptions::new(SearchOptions::default(), config.vector_weight, config.keyword_weight)
            .normalized_weights()
            .map_err(|e| Error::InvalidConfig(format!("processor weights: {e}")))?;
        let admission = Admission::new(config.max_concurrent_queries);
        let task_retention = config.task_retention();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                search,
                sources,
                cache,
                admission,
                cancels: CancelRegistry::default(),
                flights: Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(0),
                tasks: TaskTable::new(task_retention),
            }),
        })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    pub fn in_flight(&self) -> usize {
        self.inner.admission.in_flight()
    }

    /// Answer `query` within the configured deadline.
    pub async fn process(&self, query: Query) -> Result<QueryResult> {
        let cancelled = self.inner.cancels.register(query.id);
        let _registration = Registration { inner: Arc::clone(&self.inner), id: query.id };
        self.run(query, cancelled).await
    }

    /// Abort a running query; it resolves with `Error::Cancelled`.
    pub fn cancel(&self, query_id: Uuid) -> bool {
        let found = self.inner.cancels.cancel(&query_id);
        if found {
            info!(query_id = %query_id, "cancellation requested");
        }
        found
    }

    /// Start `query` in the background; poll with [`status`](Self::status).
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, query: Query) -> Uuid {
        let id = query.id;
        self.inner.tasks.insert(id);
        let cancelled = self.inner.cancels.register(id);
        let this = self.clone();
        tokio::spawn(async move {
            let _registration = Registration { inner: Arc::clone(&this.inner), id };
            this.inner.tasks.mark_running(&id);
            let outcome = this.run(query, cancelled).await;
            this.inner.tasks.finish(&id, outcome);
        });
        id
    }

    pub fn status(&self, query_id: Uuid) -> Option<TaskStatus> {
        self.inner.tasks.status(&query_id)
    }

    /// The outcome of a finished submitted query, removing it from the table.
    pub fn take_result(&self, query_id: Uuid) -> Option<Result<QueryResult>> {
        self.inner.tasks.take(&query_id)
    }

    /// Health of one data source, as reported by the source manager.
    pub async fn source_health(&self, source_id: &str) -> Result<HealthStatus> {
        match &self.inner.sources {
            Some(sources) => sources.check_health(source_id).await,
            None => Err(Error::NotFound(format!("data source '{source_id}'"))),
        }
    }

    pub async fn health(&self) -> ProcessorHealth {
        ProcessorHealth {
            backend: self.inner.search.health_check().await,
            cache: self.inner.cache.stats(),
            in_flight: self.in_flight(),
            max_concurrent_queries: self.inner.config.max_concurrent_queries,
        }
    }

    async fn run(&self, query: Query, cancelled: oneshot::Receiver<()>) -> Result<QueryResult> {
        let started = Instant::now();
        let query_id = query.id;
        let outcome = tokio::select! {
            res = self.execute(query, started) => res,
            Ok(()) = cancelled => Err(Error::Cancelled),
        };
        let elapsed_ms = elapsed_ms(started);
        match &outcome {
            Ok(r) => {
                let state = if r.cached { "cached" } else { "completed" };
                info!(query_id = %query_id, state, results = r.results.len(), confidence = r.confidence, elapsed_ms, "query finished");
            }
            Err(e) => warn!(query_id = %query_id, state = state_of(e), error = %e, elapsed_ms, "query finished"),
        }
        outcome
    }

    async fn execute(&self, query: Query, started: Instant) -> Result<QueryResult> {
        query.validate()?;
        let cfg = &self.inner.config;
        let deadline = Deadline::now() + cfg.default_timeout();
        let key = fingerprint(&query);
        let query_id = query.id;

        if cfg.cache_enabled {
            if let Ok(Some(hit)) = timeout_at(deadline, self.inner.cache.get(&key)).await {
                return Ok(QueryResult { id: query_id, cached: true, processing_time_ms: elapsed_ms(started), ..hit });
            }
        }

        loop {
            let (computation, flight_deadline): (Computation, Deadline) = if cfg.coalesce_identical {
                let (shared, flight_deadline) = self.join_or_start(&key, &query, deadline);
                (shared.boxed(), flight_deadline)
            } else {
                (Arc::clone(&self.inner).compute(key.clone(), query.clone(), deadline).boxed(), deadline)
            };
            let outcome = timeout_at(deadline, computation).await.map_err(|_| Error::Timeout(cfg.default_timeout()))?;
            match outcome {
                // A joined computation ran out of its own, earlier budget.
                Err(Error::Timeout(_)) if flight_deadline < deadline && Deadline::now() < deadline => {
                    debug!(query_id = %query_id, "joined computation timed out, retrying within own deadline");
                }
                outcome => {
                    let mut result = outcome?;
                    result.id = query_id;
                    result.processing_time_ms = elapsed_ms(started);
                    return Ok(result);
                }
            }
        }
    }

    /// The in-flight computation for `key` and the deadline it runs under,
    /// starting one if none is running.
    fn join_or_start(&self, key: &str, query: &Query, deadline: Deadline) -> (Shared<Computation>, Deadline) {
        let mut flights = self.inner.flights.lock();
        if let Some((existing, flight_deadline)) =
            flights.get(key).and_then(|f| f.shared.upgrade().map(|shared| (shared, f.deadline)))
        {
            debug!(query_id = %query.id, "joined identical in-flight query");
            return (existing, flight_deadline);
        }
        let flight_id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
        let guard = FlightGuard { inner: Arc::clone(&self.inner), key: key.to_string(), flight_id };
        let work = Arc::clone(&self.inner).compute(key.to_string(), query.clone(), deadline);
        let shared = async move {
            let _guard = guard;
            work.await
        }
        .boxed()
        .shared();
        if let Some(weak) = shared.downgrade() {
            flights.insert(key.to_string(), Flight { id: flight_id, deadline, shared: weak });
        }
        (shared, deadline)
    }
}
