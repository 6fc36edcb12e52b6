use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use lumen_core::config::{EmbeddingConfig, EmbeddingProvider};
use lumen_core::traits::EmbeddingClient;
use lumen_core::{Error, Result};
use tracing::info;
use twox_hash::XxHash64;

pub mod http;

pub use http::HttpEmbeddingClient;

/// Deterministic bag-of-tokens embedder.
///
/// Each lower-cased token is hashed into one of `dim` buckets; the vector is
/// L2-normalized. Texts sharing tokens have positive cosine similarity, which
/// is enough for offline development and reproducible tests.
pub struct HashEmbedder {
    dim: usize,
    id: String,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim, id: format!("hash:xxh64:d{dim}") }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        if self.dim == 0 {
            return v;
        }
        for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let token = token.to_lowercase();
            let mut hasher = XxHash64::with_seed(0);
            token.hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h as usize) % self.dim;
            // Bucket weight in [0.5, 1.0] so no token contributes zero.
            let val = 0.5 + (((h >> 32) as u32) as f32) / (u32::MAX as f32) * 0.5;
            v[idx] += val;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 1e-6 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingClient for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.id
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

/// Build the embedding client selected by configuration.
pub fn get_default_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingClient>> {
    match config.provider {
        EmbeddingProvider::Hash => {
            if config.dimension == 0 {
                return Err(Error::InvalidConfig("embedding.dimension must be greater than zero".into()));
            }
            info!(dimension = config.dimension, "using hash embedder");
            Ok(Arc::new(HashEmbedder::new(config.dimension)))
        }
        EmbeddingProvider::Http => Ok(Arc::new(HttpEmbeddingClient::from_config(config)?)),
    }
}
