use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;

use lumen_core::config::{CacheConfig, ProcessorConfig};
use lumen_core::filter::{Filter, FilterOperator};
use lumen_core::traits::{DataSourceManager, QueryCache, VectorSearch};
use lumen_core::types::{
    HealthStatus, HybridSearchOptions, Metadata, Query, RankedResult, SearchOptions, SearchResult, SourceSearchOptions,
};
use lumen_core::{Error, Result};
use lumen_query::{MemoryCache, QueryProcessor, TaskStatus};

fn meta(v: serde_json::Value) -> Metadata {
    v.as_object().cloned().unwrap_or_default()
}

#[derive(Default)]
struct StubSearch {
    delay: Duration,
    /// Latency of the first call only, when set.
    first_delay: Option<Duration>,
    hits: Vec<RankedResult>,
    fail: Option<Error>,
    semantic_calls: AtomicUsize,
    hybrid_calls: AtomicUsize,
}

impl StubSearch {
    fn returning(hits: Vec<RankedResult>) -> Self {
        Self { hits, ..Self::default() }
    }

    fn calls(&self) -> usize {
        self.semantic_calls.load(Ordering::SeqCst) + self.hybrid_calls.load(Ordering::SeqCst)
    }

    async fn answer(&self) -> Result<Vec<RankedResult>> {
        let delay = match self.first_delay {
            Some(first) if self.calls() == 1 => first,
            _ => self.delay,
        };
        tokio::time::sleep(delay).await;
        match &self.fail {
            Some(e) => Err(e.clone()),
            None => Ok(self.hits.clone()),
        }
    }
}

#[async_trait]
impl VectorSearch for StubSearch {
    async fn semantic_search(&self, _query_text: &str, _options: &SearchOptions) -> Result<Vec<RankedResult>> {
        self.semantic_calls.fetch_add(1, Ordering::SeqCst);
        self.answer().await
    }

    async fn hybrid_search(&self, _query_text: &str, _options: &HybridSearchOptions) -> Result<Vec<RankedResult>> {
        self.hybrid_calls.fetch_add(1, Ordering::SeqCst);
        self.answer().await
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus::healthy("stub")
    }
}

#[derive(Default)]
struct StubSources {
    delay: Duration,
    hits: Vec<SearchResult>,
    fail: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl DataSourceManager for StubSources {
    async fn search(&self, _query: &Query, _options: &SourceSearchOptions) -> Result<Vec<SearchResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            Err(Error::data_source("wiki", "connection reset"))
        } else {
            Ok(self.hits.clone())
        }
    }

    async fn check_health(&self, source_id: &str) -> Result<HealthStatus> {
        if source_id == "wiki" {
            Ok(HealthStatus::healthy("stub"))
        } else {
            Err(Error::NotFound(format!("source '{source_id}'")))
        }
    }
}

fn vector_hits() -> Vec<RankedResult> {
    vec![
        RankedResult::from_similarity("doc-1", 0.87654, meta(json!({"title": "Rust", "content": "x".repeat(300), "lang": "en"}))),
        RankedResult::from_similarity("doc-2", 0.6, meta(json!({"title": "Tokio", "lang": "de"}))),
        RankedResult::from_similarity("doc-3", 0.05, meta(json!({"title": "Noise"}))),
    ]
}

fn source_hit(id: &str, score: f32) -> SearchResult {
    SearchResult {
        content_id: id.into(),
        source_id: "wiki".into(),
        source_name: "Wiki".into(),
        title: id.into(),
        excerpt: "an excerpt from the wiki page".into(),
        relevance_score: score,
        embedding: None,
        metadata: Metadata::new(),
    }
}

fn processor(
    config: ProcessorConfig,
    search: Arc<StubSearch>,
    sources: Option<Arc<StubSources>>,
) -> (QueryProcessor, Arc<MemoryCache>) {
    let cache = Arc::new(MemoryCache::new(&CacheConfig::default()));
    let sources = sources.map(|s| s as Arc<dyn DataSourceManager>);
    let p = QueryProcessor::new(config, search, sources, cache.clone()).expect("processor");
    (p, cache)
}

#[tokio::test(start_paused = true)]
async fn second_identical_query_is_served_from_cache_until_ttl() {
    let search = Arc::new(StubSearch { delay: Duration::from_millis(50), ..StubSearch::returning(vector_hits()) });
    let (p, cache) = processor(ProcessorConfig::default(), search.clone(), None);

    let start = tokio::time::Instant::now();
    let first = p.process(Query::new("what is rust")).await.unwrap();
    let cold = start.elapsed();
    assert!(!first.cached);
    let second_query = Query::new("  What IS   rust ");
    let second_id = second_query.id;
    let start = tokio::time::Instant::now();
    let second = p.process(second_query).await.unwrap();
    let warm = start.elapsed();
    assert!(second.cached);
    assert!(cold >= Duration::from_millis(50));
    assert!(warm < Duration::from_millis(5), "cache hit took {warm:?}");
    assert_eq!(second.id, second_id);
    assert_eq!(second.results, first.results);
    assert_eq!(search.calls(), 1);
    assert!(cache.stats().hit_rate > 0.0);

    tokio::time::advance(Duration::from_secs(301)).await;
    let third = p.process(Query::new("what is rust")).await.unwrap();
    assert!(!third.cached);
    assert_eq!(search.calls(), 2);
}

#[tokio::test]
async fn results_are_rounded_filtered_and_scored() {
    let search = Arc::new(StubSearch::returning(vector_hits()));
    let (p, _) = processor(ProcessorConfig::default(), search, None);
    let r = p.process(Query::new("rust")).await.unwrap();
    let ids: Vec<&str> = r.results.iter().map(|h| h.content_id.as_str()).collect();
    assert_eq!(ids, vec!["doc-1", "doc-2"], "doc-3 is below the confidence floor");
    assert_eq!(r.results[0].relevance_score, 0.877);
    assert_eq!(r.results[0].source_id, "vector-index");
    assert_eq!(r.results[0].title, "Rust");
    assert!(r.confidence > 0.0 && r.confidence <= 1.0);
    assert!(r.partial_failure.is_none());

    let filtered = p.process(Query::new("rust").with_filters(vec![Filter::eq("lang", "de")])).await.unwrap();
    assert_eq!(filtered.results.len(), 1);
    assert_eq!(filtered.results[0].content_id, "doc-2");
}

#[tokio::test]
async fn keyword_weight_selects_search_mode() {
    let search = Arc::new(StubSearch::returning(vector_hits()));
    let (p, _) = processor(ProcessorConfig::default(), search.clone(), None);
    p.process(Query::new("hybrid please")).await.unwrap();
    assert_eq!(search.hybrid_calls.load(Ordering::SeqCst), 1);

    let semantic_only = ProcessorConfig { keyword_weight: 0.0, ..ProcessorConfig::default() };
    let search = Arc::new(StubSearch::returning(vector_hits()));
    let (p, _) = processor(semantic_only, search.clone(), None);
    p.process(Query::new("semantic please")).await.unwrap();
    assert_eq!(search.semantic_calls.load(Ordering::SeqCst), 1);
    assert_eq!(search.hybrid_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn branches_merge_in_declared_order() {
    let search = Arc::new(StubSearch::returning(vec![RankedResult::from_similarity("v", 0.5, Metadata::new())]));
    let sources = Arc::new(StubSources { hits: vec![source_hit("s", 0.5)], ..StubSources::default() });
    let (p, _) = processor(ProcessorConfig::default(), search, Some(sources));
    for i in 0..3 {
        let r = p.process(Query::new(format!("order {i}"))).await.unwrap();
        let sources: Vec<&str> = r.results.iter().map(|h| h.source_id.as_str()).collect();
        assert_eq!(sources, vec!["vector-index", "wiki"]);
    }
}

#[tokio::test(start_paused = true)]
async fn slow_source_is_cut_off_at_the_deadline() {
    let config = ProcessorConfig { default_timeout_ms: 50, ..ProcessorConfig::default() };
    let search = Arc::new(StubSearch { delay: Duration::from_millis(10), ..StubSearch::returning(vector_hits()) });
    let sources = Arc::new(StubSources { delay: Duration::from_millis(500), hits: vec![source_hit("late", 0.9)], ..StubSources::default() });
    let (p, _) = processor(config, search, Some(sources));

    let start = tokio::time::Instant::now();
    let r = p.process(Query::new("deadline")).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(100), "took {:?}", start.elapsed());
    assert!(r.results.iter().all(|h| h.source_id == "vector-index"));
    let failure = r.partial_failure.expect("partial failure");
    assert_eq!(failure.failed_branches.len(), 1);
    assert_eq!(failure.failed_branches[0].branch, "data-source");
}

#[tokio::test(start_paused = true)]
async fn every_branch_past_deadline_is_a_timeout() {
    let config = ProcessorConfig { default_timeout_ms: 50, ..ProcessorConfig::default() };
    let search = Arc::new(StubSearch { delay: Duration::from_millis(400), ..StubSearch::returning(vector_hits()) });
    let sources = Arc::new(StubSources { delay: Duration::from_millis(400), ..StubSources::default() });
    let (p, cache) = processor(config, search, Some(sources));
    let err = p.process(Query::new("too slow")).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{err:?}");
    assert!(err.is_transient());
    assert_eq!(cache.stats().total_keys, 0);
    assert_eq!(p.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn sequential_fan_out_still_honors_deadline() {
    let config = ProcessorConfig { default_timeout_ms: 50, enable_parallel_search: false, ..ProcessorConfig::default() };
    let search = Arc::new(StubSearch { delay: Duration::from_millis(10), ..StubSearch::returning(vector_hits()) });
    let sources = Arc::new(StubSources { delay: Duration::from_millis(500), ..StubSources::default() });
    let (p, _) = processor(config, search, Some(sources));
    let r = p.process(Query::new("sequential")).await.unwrap();
    assert!(!r.results.is_empty());
    assert!(r.partial_failure.is_some());
}

#[tokio::test]
async fn failing_source_degrades_to_partial_result() {
    let search = Arc::new(StubSearch::returning(vector_hits()));
    let sources = Arc::new(StubSources { fail: true, ..StubSources::default() });
    let (p, _) = processor(ProcessorConfig::default(), search, Some(sources));
    let r = p.process(Query::new("degraded")).await.unwrap();
    assert_eq!(r.results.len(), 2);
    let failure = r.partial_failure.expect("partial failure");
    assert_eq!(failure.failed_branches[0].branch, "data-source");
    assert!(failure.failed_branches[0].reason.contains("connection reset"));
}

#[tokio::test]
async fn failing_vector_branch_keeps_source_results() {
    let search = Arc::new(StubSearch { fail: Some(Error::backend("flat", "index offline")), ..StubSearch::default() });
    let sources = Arc::new(StubSources { hits: vec![source_hit("s", 0.8)], ..StubSources::default() });
    let (p, _) = processor(ProcessorConfig::default(), search, Some(sources));
    let r = p.process(Query::new("vector down")).await.unwrap();
    assert_eq!(r.results.len(), 1);
    assert_eq!(r.results[0].source_id, "wiki");
    assert_eq!(r.partial_failure.unwrap().failed_branches[0].branch, "vector");
}

#[tokio::test]
async fn total_failure_surfaces_typed_errors() {
    let search = Arc::new(StubSearch { fail: Some(Error::backend("flat", "index offline")), ..StubSearch::default() });
    let sources = Arc::new(StubSources { fail: true, ..StubSources::default() });
    let (p, _) = processor(ProcessorConfig::default(), search, Some(sources.clone()));
    let err = p.process(Query::new("all down")).await.unwrap_err();
    match err {
        Error::Backend { message, .. } => {
            assert!(message.contains("index offline"));
            assert!(message.contains("connection reset"));
        }
        other => panic!("expected backend error, got {other:?}"),
    }

    let search = Arc::new(StubSearch { fail: Some(Error::Embedding("model offline".into())), ..StubSearch::default() });
    let (p, _) = processor(ProcessorConfig::default(), search, Some(sources));
    let err = p.process(Query::new("all down")).await.unwrap_err();
    assert!(matches!(err, Error::Embedding(_)), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn admission_rejects_exactly_the_overflow() {
    let config = ProcessorConfig { max_concurrent_queries: 2, ..ProcessorConfig::default() };
    let search = Arc::new(StubSearch { delay: Duration::from_millis(200), ..StubSearch::returning(vector_hits()) });
    let (p, _) = processor(config, search, None);

    let sample = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        p.in_flight()
    };
    let (outcomes, in_flight_midway) =
        tokio::join!(join_all((0..3).map(|i| p.process(Query::new(format!("distinct query {i}"))))), sample);
    assert_eq!(in_flight_midway, 2, "never more than the limit in flight");
    let rejected: Vec<&Error> = outcomes.iter().filter_map(|o| o.as_ref().err()).collect();
    assert_eq!(rejected.len(), 1);
    assert!(matches!(rejected[0], Error::CapacityExceeded { limit: 2, .. }));
    assert!(rejected[0].retry_after().is_some());
    assert_eq!(p.in_flight(), 0);

    // A cache hit does not need a slot.
    let ok = outcomes.iter().position(|o| o.is_ok()).unwrap();
    let again = p.process(Query::new(format!("distinct query {ok}"))).await.unwrap();
    assert!(again.cached);
}

#[tokio::test(start_paused = true)]
async fn identical_cold_queries_share_one_computation() {
    let search = Arc::new(StubSearch { delay: Duration::from_millis(100), ..StubSearch::returning(vector_hits()) });
    let sources = Arc::new(StubSources { delay: Duration::from_millis(100), hits: vec![source_hit("s", 0.7)], ..StubSources::default() });
    let (p, _) = processor(ProcessorConfig::default(), search.clone(), Some(sources.clone()));

    let queries: Vec<Query> = (0..5).map(|_| Query::new("burst of the same question")).collect();
    let ids: Vec<_> = queries.iter().map(|q| q.id).collect();
    let outcomes = join_all(queries.into_iter().map(|q| p.process(q))).await;
    assert_eq!(search.calls(), 1);
    assert_eq!(sources.calls.load(Ordering::SeqCst), 1);
    for (outcome, id) in outcomes.into_iter().zip(ids) {
        let r = outcome.unwrap();
        assert_eq!(r.id, id);
        assert!(!r.cached);
    }
}

#[tokio::test(start_paused = true)]
async fn joined_query_keeps_its_own_deadline() {
    let config = ProcessorConfig { default_timeout_ms: 100, ..ProcessorConfig::default() };
    let search = Arc::new(StubSearch {
        delay: Duration::from_millis(10),
        first_delay: Some(Duration::from_millis(150)),
        ..StubSearch::returning(vector_hits())
    });
    let (p, _) = processor(config, search.clone(), None);

    let leader = p.clone();
    let first = tokio::spawn(async move { leader.process(Query::new("slow start")).await });
    tokio::time::sleep(Duration::from_millis(90)).await;
    let joined_at = tokio::time::Instant::now();
    let second = p.process(Query::new("slow start")).await;
    let waited = joined_at.elapsed();

    assert!(matches!(first.await.unwrap(), Err(Error::Timeout(_))));
    let r = second.expect("answered within its own budget");
    assert!(!r.cached);
    assert!(waited >= Duration::from_millis(15), "waited on the shared computation first: {waited:?}");
    assert!(waited < Duration::from_millis(100), "{waited:?}");
    assert_eq!(search.calls(), 2);
    assert_eq!(p.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn coalescing_can_be_disabled() {
    let config = ProcessorConfig { coalesce_identical: false, ..ProcessorConfig::default() };
    let search = Arc::new(StubSearch { delay: Duration::from_millis(100), ..StubSearch::returning(vector_hits()) });
    let (p, _) = processor(config, search.clone(), None);
    let outcomes = join_all((0..3).map(|_| p.process(Query::new("same")))).await;
    assert!(outcomes.iter().all(|o| o.is_ok()));
    assert_eq!(search.calls(), 3);
}

#[tokio::test]
async fn invalid_queries_are_rejected_before_search() {
    let search = Arc::new(StubSearch::returning(vector_hits()));
    let (p, _) = processor(ProcessorConfig::default(), search.clone(), None);
    assert!(matches!(p.process(Query::new("   ")).await, Err(Error::Validation(_))));
    let bad_filter = Query::new("rust").with_filters(vec![Filter::new("year", FilterOperator::In, 2020)]);
    let err = p.process(bad_filter).await.unwrap_err();
    assert!(err.is_client_error());
    assert_eq!(search.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_aborts_a_running_query() {
    let search = Arc::new(StubSearch { delay: Duration::from_secs(1), ..StubSearch::returning(vector_hits()) });
    let config = ProcessorConfig { default_timeout_ms: 5_000, ..ProcessorConfig::default() };
    let (p, _) = processor(config, search, None);

    let query = Query::new("long running");
    let id = query.id;
    let runner = p.clone();
    let handle = tokio::spawn(async move { runner.process(query).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(p.in_flight(), 1);
    assert!(p.cancel(id));
    let outcome = handle.await.unwrap();
    assert!(matches!(outcome, Err(Error::Cancelled)));
    assert_eq!(p.in_flight(), 0);
    assert!(!p.cancel(id), "already finished");
}

#[tokio::test(start_paused = true)]
async fn submitted_queries_report_status_until_taken() {
    let search = Arc::new(StubSearch { delay: Duration::from_millis(20), ..StubSearch::returning(vector_hits()) });
    let (p, _) = processor(ProcessorConfig::default(), search, None);

    let id = p.submit(Query::new("background"));
    assert!(matches!(p.status(id), Some(TaskStatus::Pending | TaskStatus::Running)));
    assert!(p.take_result(id).is_none(), "not finished yet");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(p.status(id), Some(TaskStatus::Done));
    let r = p.take_result(id).expect("finished").expect("ok");
    assert_eq!(r.id, id);
    assert_eq!(p.status(id), None);

    let slow = Arc::new(StubSearch { delay: Duration::from_secs(1), ..StubSearch::returning(vector_hits()) });
    let (p, _) = processor(ProcessorConfig::default(), slow, None);
    let id = p.submit(Query::new("to be cancelled"));
    assert!(p.cancel(id));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(p.status(id), Some(TaskStatus::Cancelled));
    assert!(matches!(p.take_result(id), Some(Err(Error::Cancelled))));
}

#[tokio::test(start_paused = true)]
async fn uncollected_task_outcomes_are_dropped_after_retention() {
    let config = ProcessorConfig { task_retention_secs: 30, ..ProcessorConfig::default() };
    let search = Arc::new(StubSearch { delay: Duration::from_millis(10), ..StubSearch::returning(vector_hits()) });
    let (p, _) = processor(config, search, None);

    let ids: Vec<_> = (0..3).map(|i| p.submit(Query::new(format!("fire and forget {i}")))).collect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ids.iter().all(|id| p.status(*id) == Some(TaskStatus::Done)));

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(ids.iter().all(|id| p.status(*id).is_none()));
    assert!(p.take_result(ids[0]).is_none());
}

#[tokio::test]
async fn health_reports_collaborators() {
    let search = Arc::new(StubSearch::returning(vector_hits()));
    let (p, _) = processor(ProcessorConfig::default(), search, None);
    p.process(Query::new("warm the cache")).await.unwrap();
    let health = p.health().await;
    assert!(health.backend.healthy);
    assert_eq!(health.in_flight, 0);
    assert_eq!(health.max_concurrent_queries, 10);
    assert_eq!(health.cache.total_keys, 1);
    assert!(matches!(p.source_health("wiki").await, Err(Error::NotFound(_))), "no source manager configured");

    let sources = Arc::new(StubSources::default());
    let (p, _) = processor(ProcessorConfig::default(), Arc::new(StubSearch::default()), Some(sources));
    assert!(p.source_health("wiki").await.unwrap().healthy);
    assert!(matches!(p.source_health("nope").await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn disabled_cache_never_stores() {
    let config = ProcessorConfig { cache_enabled: false, ..ProcessorConfig::default() };
    let search = Arc::new(StubSearch::returning(vector_hits()));
    let (p, cache) = processor(config, search.clone(), None);
    p.process(Query::new("nocache")).await.unwrap();
    let again = p.process(Query::new("nocache")).await.unwrap();
    assert!(!again.cached);
    assert_eq!(search.calls(), 2);
    assert_eq!(cache.stats().total_keys, 0);
}

#[test]
fn invalid_config_is_rejected() {
    let search: Arc<dyn VectorSearch> = Arc::new(StubSearch::default());
    let cache: Arc<dyn QueryCache> = Arc::new(MemoryCache::new(&CacheConfig::default()));
    let zero = ProcessorConfig { max_concurrent_queries: 0, ..ProcessorConfig::default() };
    assert!(matches!(QueryProcessor::new(zero, search.clone(), None, cache.clone()), Err(Error::InvalidConfig(_))));
    let weights = ProcessorConfig { vector_weight: 0.0, keyword_weight: 0.0, ..ProcessorConfig::default() };
    assert!(matches!(QueryProcessor::new(weights, search, None, cache), Err(Error::InvalidConfig(_))));
}
