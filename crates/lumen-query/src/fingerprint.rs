use serde_json::{json, Value};

use lumen_core::types::Query;

/// Lower-cased text with whitespace runs collapsed to one space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().map(str::to_lowercase).collect::<Vec<_>>().join(" ")
}

/// Cache key for `query`: blake3 over its normalized text, context and
/// filters. The query id, user and timestamp do not participate.
pub fn fingerprint(query: &Query) -> String {
    // serde_json maps are ordered by key, so equal contexts serialize equally.
    let canonical = json!({
        "text": normalize_text(&query.text),
        "context": query.context.clone().map(Value::Object).unwrap_or(Value::Null),
        "filters": query.filters(),
    });
    let mut hasher = blake3::Hasher::new();
    hasher.update(canonical.to_string().as_bytes());
    hasher.finalize().to_hex().to_string()
}
