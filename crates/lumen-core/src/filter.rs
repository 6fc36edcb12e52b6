//! Metadata filters attached to a query.
//!
//! A filter is evaluated against a result's metadata map. Numbers compare
//! numerically; strings compare lexicographically so ISO-8601 dates order
//! correctly. A missing field only satisfies `ne`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self { field: field.into(), operator, value: value.into() }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    /// Rejects filters whose value shape cannot work with the operator.
    pub fn validate(&self) -> Result<()> {
        if self.field.trim().is_empty() {
            return Err(Error::Validation("filter field must not be empty".into()));
        }
        let ok = match self.operator {
            FilterOperator::Eq | FilterOperator::Ne => true,
            FilterOperator::Gt | FilterOperator::Lt | FilterOperator::Gte | FilterOperator::Lte => {
                self.value.is_number() || self.value.is_string()
            }
            FilterOperator::In => self.value.is_array(),
            FilterOperator::Contains => !self.value.is_null() && !self.value.is_array() && !self.value.is_object(),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "filter on '{}' has a value of the wrong shape for operator {:?}",
                self.field, self.operator
            )))
        }
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        let Some(actual) = metadata.get(&self.field) else {
            return self.operator == FilterOperator::Ne;
        };
        match self.operator {
            FilterOperator::Eq => values_equal(actual, &self.value),
            FilterOperator::Ne => !values_equal(actual, &self.value),
            FilterOperator::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::Gte => matches!(compare(actual, &self.value), Some(Ordering::Greater | Ordering::Equal)),
            FilterOperator::Lte => matches!(compare(actual, &self.value), Some(Ordering::Less | Ordering::Equal)),
            FilterOperator::In => match &self.value {
                Value::Array(options) => options.iter().any(|o| values_equal(actual, o)),
                _ => false,
            },
            FilterOperator::Contains => match (actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => {
                    haystack.to_lowercase().contains(&needle.to_lowercase())
                }
                (Value::Array(items), needle) => items.iter().any(|i| values_equal(i, needle)),
                _ => false,
            },
        }
    }
}

/// True when every filter matches; an empty slice matches everything.
pub fn matches_all(filters: &[Filter], metadata: &Metadata) -> bool {
    filters.iter().all(|f| f.matches(metadata))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(v: Value) -> Metadata {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn numeric_and_string_comparisons() {
        let m = meta(json!({"year": 2021, "createdAt": "2024-03-01T00:00:00Z", "tags": ["rust", "search"]}));
        assert!(Filter::new("year", FilterOperator::Gte, 2021).matches(&m));
        assert!(!Filter::new("year", FilterOperator::Gt, 2021.0).matches(&m));
        assert!(Filter::new("createdAt", FilterOperator::Lt, "2025-01-01").matches(&m));
        assert!(Filter::new("tags", FilterOperator::Contains, "rust").matches(&m));
        assert!(Filter::new("year", FilterOperator::In, json!([2020, 2021])).matches(&m));
    }

    #[test]
    fn missing_field_only_matches_ne() {
        let m = meta(json!({"a": 1}));
        assert!(Filter::new("b", FilterOperator::Ne, 1).matches(&m));
        assert!(!Filter::eq("b", 1).matches(&m));
    }

    #[test]
    fn malformed_filters_are_rejected() {
        assert!(Filter::new("year", FilterOperator::In, 2021).validate().is_err());
        assert!(Filter::new("", FilterOperator::Eq, 1).validate().is_err());
        assert!(Filter::new("x", FilterOperator::Gt, json!({"a": 1})).validate().is_err());
        assert!(Filter::new("x", FilterOperator::Contains, "abc").validate().is_ok());
    }
}
