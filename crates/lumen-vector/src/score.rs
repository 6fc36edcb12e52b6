//! Similarity math and normalization of provider-native scores.
//!
//! Every backend reports scores in `[0, 1]`, higher is better, so ranking code
//! never needs to know which provider produced a result.
use lumen_core::config::Metric;

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let norm = (dot(a, a).sqrt() * dot(b, b).sqrt()).max(1e-8);
    dot(a, b) / norm
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
}

/// Raw provider-native score for `metric`: a similarity for cosine and dot,
/// a distance for euclidean.
pub fn raw_score(metric: Metric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        Metric::Cosine => cosine_similarity(a, b),
        Metric::Euclidean => euclidean_distance(a, b),
        Metric::Dot => dot(a, b),
    }
}

/// Map a provider-native score into `[0, 1]` similarity space.
pub fn normalize(metric: Metric, raw: f32) -> f32 {
    if !raw.is_finite() {
        return 0.0;
    }
    match metric {
        Metric::Euclidean => 1.0 / (1.0 + raw.max(0.0)),
        Metric::Cosine | Metric::Dot => raw.clamp(0.0, 1.0),
    }
}

pub fn similarity(metric: Metric, a: &[f32], b: &[f32]) -> f32 {
    normalize(metric, raw_score(metric, a, b))
}
