//! Turning branch outputs into the final, ordered result list and scoring
//! how much that list can be trusted.
use std::collections::{HashMap, HashSet};

use serde_json::Value;

use lumen_core::config::{ConfidenceConfig, ProcessorConfig};
use lumen_core::filter::{matches_all, Filter};
use lumen_core::types::{round_score, RankedResult, SearchResult};

const EXCERPT_CHARS: usize = 500;

fn str_field<'a>(r: &'a RankedResult, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| r.metadata.get(*k).and_then(Value::as_str))
}

/// Attribute a ranked vector hit to the vector-index source.
pub fn from_ranked(r: RankedResult, config: &ProcessorConfig) -> SearchResult {
    let title = str_field(&r, &["title", "name"]).unwrap_or(r.id.as_str()).to_string();
    let excerpt = match str_field(&r, &["excerpt"]) {
        Some(e) => e.to_string(),
        None => str_field(&r, &["content", "text"]).map(|t| t.chars().take(EXCERPT_CHARS).collect::<String>()).unwrap_or_default(),
    };
    SearchResult {
        content_id: r.id,
        source_id: config.vector_source_id.clone(),
        source_name: config.vector_source_name.clone(),
        title,
        excerpt,
        relevance_score: r.final_score,
        embedding: None,
        metadata: r.metadata,
    }
}

/// Concatenate branch outputs in the given order, then clamp and round, filter, sort,
/// dedup and cap per source. The sort is stable so equal scores keep branch
/// order.
pub fn merge(branches: Vec<Vec<SearchResult>>, filters: &[Filter], config: &ProcessorConfig) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = branches
        .into_iter()
        .flatten()
        .map(|mut r| {
            r.relevance_score = round_score(r.relevance_score.clamp(0.0, 1.0));
            r
        })
        .filter(|r| matches_all(filters, &r.metadata))
        .filter(|r| r.relevance_score >= config.min_confidence_threshold)
        .collect();
    results.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));

    let mut seen = HashSet::new();
    let mut per_source: HashMap<String, usize> = HashMap::new();
    results.retain(|r| {
        if !seen.insert((r.source_id.clone(), r.content_id.clone())) {
            return false;
        }
        let count = per_source.entry(r.source_id.clone()).or_insert(0);
        *count += 1;
        *count <= config.max_results_per_source
    });
    results
}

/// Heuristic trust in a result list, in `[0, 1]`. More distinct sources and
/// more content raise it; short content and weak relevance lower it.
pub fn confidence(results: &[SearchResult], config: &ConfidenceConfig) -> f32 {
    if results.is_empty() {
        return 0.0;
    }
    let avg = results.iter().map(|r| r.relevance_score).sum::<f32>() / results.len() as f32;
    let sources = results.iter().map(|r| r.source_id.as_str()).collect::<HashSet<_>>().len();
    let total_chars: usize = results.iter().map(|r| r.excerpt.chars().count()).sum();

    let mut score = avg + config.source_bonus * sources.min(config.max_source_bonus_count) as f32;
    if total_chars < config.short_content_chars {
        score -= config.short_content_penalty;
    }
    if avg < config.low_relevance_threshold {
        score -= config.low_relevance_penalty;
    }
    if config.volume_chars > 0 {
        score += config.volume_bonus * (total_chars as f32 / config.volume_chars as f32).min(1.0);
    }
    round_score(score.clamp(0.0, 1.0))
}
