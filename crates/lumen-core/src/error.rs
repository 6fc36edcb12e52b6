use std::time::Duration;

use thiserror::Error;

/// Error taxonomy shared by every lumen crate.
///
/// `Clone` so that a single computed outcome can be handed to every caller
/// waiting on the same query fingerprint.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Capacity exceeded: {limit} queries already in flight")]
    CapacityExceeded { limit: usize, retry_after_ms: u64 },

    #[error("Query timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Query was cancelled")]
    Cancelled,

    #[error("Embedding client is not configured")]
    EmbeddingUnavailable,

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Backend '{provider}' failed: {message}")]
    Backend { provider: String, message: String },

    #[error("Backend '{provider}' failed to upsert {} record(s): {message}", .failed_ids.len())]
    PartialUpsert { provider: String, failed_ids: Vec<String>, message: String },

    #[error("Data source '{source_id}' failed: {message}")]
    DataSource { source_id: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    pub fn backend(provider: impl Into<String>, message: impl ToString) -> Self {
        Self::Backend { provider: provider.into(), message: message.to_string() }
    }

    pub fn data_source(source_id: impl Into<String>, message: impl ToString) -> Self {
        Self::DataSource { source_id: source_id.into(), message: message.to_string() }
    }

    /// Transient errors are worth retrying unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. } | Self::Timeout(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CapacityExceeded { retry_after_ms, .. } => Some(Duration::from_millis(*retry_after_ms)),
            _ => None,
        }
    }

    /// Caller-correctable errors (the 4xx family).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
