//! Provider selection and checks shared by every backend.
use lumen_core::config::{BackendConfig, Provider};
use lumen_core::traits::VectorIndexBackend;
use lumen_core::types::VectorRecord;
use lumen_core::{Error, Result};
use tracing::info;

use crate::flat::FlatIndex;
use crate::managed::ManagedIndex;
use crate::remote_collection::RemoteCollection;

/// Build and initialize the backend named by `config.provider`.
pub async fn build_backend(config: BackendConfig) -> Result<Box<dyn VectorIndexBackend>> {
    let mut backend: Box<dyn VectorIndexBackend> = match config.provider {
        Provider::Flat => Box::new(FlatIndex::new(config)),
        Provider::RemoteCollection => Box::new(RemoteCollection::new(config)),
        Provider::Managed => Box::new(ManagedIndex::new(config)),
    };
    backend.initialize().await?;
    info!(provider = backend.provider(), dimension = backend.dimension(), "vector backend ready");
    Ok(backend)
}

/// A required, non-blank configuration field.
pub(crate) fn require<'a>(provider: &str, field: &str, value: Option<&'a String>) -> Result<&'a str> {
    match value.map(|v| v.trim()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::InvalidConfig(format!("{provider}: '{field}' is required"))),
    }
}

pub(crate) fn check_records(records: &[VectorRecord], dimension: usize) -> Result<()> {
    for r in records {
        if r.id.is_empty() {
            return Err(Error::Validation("record id must not be empty".into()));
        }
        if r.vector.len() != dimension {
            return Err(Error::Validation(format!(
                "record '{}' has dimension {}, index expects {}",
                r.id,
                r.vector.len(),
                dimension
            )));
        }
        if r.vector.iter().any(|x| !x.is_finite()) {
            return Err(Error::Validation(format!("record '{}' contains non-finite values", r.id)));
        }
    }
    Ok(())
}

pub(crate) fn check_query_vector(vector: &[f32], dimension: usize) -> Result<()> {
    if vector.len() == dimension {
        Ok(())
    } else {
        Err(Error::Validation(format!("query vector has dimension {}, index expects {}", vector.len(), dimension)))
    }
}
