//! Ranking factors layered on top of raw similarity, and the weighted fusion
//! of semantic and keyword result sets.
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use lumen_core::config::EngineConfig;
use lumen_core::types::{sort_ranked, Metadata, RankedResult, RankingFactors, SearchOptions};
use lumen_text::{terms, KeywordHit};

const MS_PER_DAY: f64 = 86_400_000.0;

fn collect_strings(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::String(s) => out.extend(terms(s)),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Fraction of query terms found in any string metadata value, scaled by `max`.
pub fn metadata_bonus(query_terms: &HashSet<String>, metadata: &Metadata, max: f32) -> f32 {
    if query_terms.is_empty() || metadata.is_empty() {
        return 0.0;
    }
    let mut meta_terms = HashSet::new();
    metadata.values().for_each(|v| collect_strings(v, &mut meta_terms));
    let overlap = query_terms.iter().filter(|t| meta_terms.contains(*t)).count();
    max * overlap as f32 / query_terms.len() as f32
}

/// `createdAt` / `created_at` as RFC 3339 or epoch milliseconds.
pub fn created_at(metadata: &Metadata) -> Option<DateTime<Utc>> {
    let from_millis = |ms: i64| Utc.timestamp_millis_opt(ms).single();
    match metadata.get("createdAt").or_else(|| metadata.get("created_at"))? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .ok()
            .or_else(|| s.trim().parse::<i64>().ok().and_then(from_millis)),
        Value::Number(n) => n.as_i64().and_then(from_millis),
        _ => None,
    }
}

/// Exponential decay: full bonus when new, half after one half-life.
pub fn recency_bonus(metadata: &Metadata, now: DateTime<Utc>, config: &EngineConfig) -> f32 {
    let Some(created) = created_at(metadata) else {
        return 0.0;
    };
    if config.recency_half_life_days <= 0.0 {
        return 0.0;
    }
    let age_days = (now - created).num_milliseconds() as f64 / MS_PER_DAY;
    if age_days <= 0.0 {
        return config.recency_bonus_max;
    }
    (config.recency_bonus_max as f64 * 0.5f64.powf(age_days / config.recency_half_life_days)) as f32
}

/// Recompute every result's factors against `query_text` and re-sort.
pub fn apply_factors(results: &mut [RankedResult], query_text: &str, config: &EngineConfig, now: DateTime<Utc>) {
    let query_terms: HashSet<String> = terms(query_text).into_iter().collect();
    for r in results.iter_mut() {
        let factors = RankingFactors {
            semantic: r.vector_score,
            metadata: metadata_bonus(&query_terms, &r.metadata, config.metadata_bonus_max),
            recency: recency_bonus(&r.metadata, now, config),
        };
        r.ranking_factors = factors;
        r.final_score = factors.final_score();
    }
    sort_ranked(results);
}

/// Scale `score` into `[0, 1]` against the largest score in its set.
fn scaled(score: f32, max: f32) -> f32 {
    if max > 0.0 {
        (score / max).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Weighted merge of a semantic set and a keyword set, each scaled by its own
/// maximum first. A component missing for an id counts as zero.
pub fn fuse(
    semantic: Vec<RankedResult>,
    keyword: Vec<KeywordHit>,
    vector_weight: f32,
    keyword_weight: f32,
    options: &SearchOptions,
) -> Vec<RankedResult> {
    let max_semantic = semantic.iter().map(|r| r.final_score).fold(0.0f32, f32::max);
    let max_keyword = keyword.iter().map(|h| h.score).fold(0.0f32, f32::max);
    let mut by_id: BTreeMap<String, RankedResult> = BTreeMap::new();
    for mut r in semantic {
        r.final_score = vector_weight * scaled(r.final_score, max_semantic);
        by_id.insert(r.id.clone(), r);
    }
    for hit in keyword {
        let norm = scaled(hit.score, max_keyword);
        match by_id.get_mut(&hit.id) {
            Some(r) => {
                r.keyword_score = Some(norm);
                r.final_score += keyword_weight * norm;
            }
            None => {
                let metadata = if options.include_metadata { hit.metadata } else { Metadata::new() };
                by_id.insert(
                    hit.id.clone(),
                    RankedResult {
                        id: hit.id,
                        vector_score: 0.0,
                        keyword_score: Some(norm),
                        ranking_factors: RankingFactors::default(),
                        final_score: keyword_weight * norm,
                        metadata,
                    },
                );
            }
        }
    }
    let mut merged: Vec<RankedResult> = by_id
        .into_values()
        .map(|mut r| {
            r.final_score = r.final_score.clamp(0.0, 1.0);
            r
        })
        .filter(|r| options.threshold.map_or(true, |t| r.final_score >= t))
        .collect();
    sort_ranked(&mut merged);
    merged.truncate(options.top_k);
    merged
}
