//! Client for OpenAI-compatible `/embeddings` endpoints.
use std::time::Duration;

use async_trait::async_trait;
use lumen_core::config::EmbeddingConfig;
use lumen_core::traits::EmbeddingClient;
use lumen_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dim: usize,
    id: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddingClient {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| Error::InvalidConfig("embedding.endpoint is required for the http provider".into()))?;
        if config.dimension == 0 {
            return Err(Error::InvalidConfig("embedding.dimension must be greater than zero".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| Error::InvalidConfig(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dim: config.dimension,
            id: format!("http:{}:d{}", config.model, config.dimension),
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut req = self.client.post(&self.endpoint).json(&EmbeddingRequest { input: texts, model: &self.model });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| Error::Embedding(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!("{status}: {body}")));
        }
        let body: EmbeddingResponse = resp.json().await.map_err(|e| Error::Embedding(e.to_string()))?;
        parse_embeddings(body, texts.len(), self.dim)
    }
}

fn parse_embeddings(mut body: EmbeddingResponse, expected: usize, dim: usize) -> Result<Vec<Vec<f32>>> {
    if body.data.len() != expected {
        return Err(Error::Embedding(format!("expected {expected} embeddings, got {}", body.data.len())));
    }
    body.data.sort_by_key(|d| d.index);
    body.data
        .into_iter()
        .map(|d| {
            if d.embedding.len() == dim {
                Ok(d.embedding)
            } else {
                Err(Error::Embedding(format!("expected dimension {dim}, got {}", d.embedding.len())))
            }
        })
        .collect()
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    fn model_id(&self) -> &str {
        &self.id
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop().ok_or_else(|| Error::Embedding("empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = texts.len(), model = %self.model, "requesting embeddings");
        self.request(texts).await
    }
}
