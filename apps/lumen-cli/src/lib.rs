//! Wiring for the `lumen` binary: configuration to a running engine and
//! processor, plus the JSONL document loader.
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::Deserialize;
use tracing::info;

use lumen_core::config::AppConfig;
use lumen_core::types::{Metadata, VectorRecord};
use lumen_embed::get_default_embedder;
use lumen_hybrid::{Document, VectorSearchEngine};
use lumen_query::{MemoryCache, QueryProcessor};
use lumen_vector::build_backend;

/// One line of a documents file. Lines carrying a `vector` are stored as-is;
/// the rest are embedded from `text`.
#[derive(Debug, Deserialize)]
struct DocumentLine {
    id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    vector: Option<Vec<f32>>,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Default)]
pub struct Corpus {
    pub documents: Vec<Document>,
    pub records: Vec<VectorRecord>,
}

impl Corpus {
    pub fn len(&self) -> usize {
        self.documents.len() + self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn load_corpus(path: &Path) -> anyhow::Result<Corpus> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut corpus = Corpus::default();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let doc: DocumentLine =
            serde_json::from_str(&line).with_context(|| format!("{}:{}: invalid document", path.display(), n + 1))?;
        match (doc.vector, doc.text) {
            (Some(vector), _) => corpus.records.push(VectorRecord::new(doc.id, vector).with_metadata(doc.metadata)),
            (None, Some(text)) => corpus.documents.push(Document { id: doc.id, text, metadata: doc.metadata }),
            (None, None) => bail!("{}:{}: document '{}' has neither text nor vector", path.display(), n + 1, doc.id),
        }
    }
    Ok(corpus)
}

pub struct Runtime {
    pub engine: Arc<VectorSearchEngine>,
    pub processor: QueryProcessor,
}

/// Backend, embedder, engine, cache and processor, as configured.
pub async fn build(app: &AppConfig) -> anyhow::Result<Runtime> {
    let backend = build_backend(app.vector.clone()).await?;
    let embedder = get_default_embedder(&app.embedding)?;
    let engine = Arc::new(VectorSearchEngine::new(Arc::from(backend), Some(embedder), app.engine.clone())?);
    let cache = Arc::new(MemoryCache::new(&app.cache));
    let processor = QueryProcessor::new(app.processor.clone(), engine.clone(), None, cache)?;
    Ok(Runtime { engine, processor })
}

impl Runtime {
    pub async fn ingest(&self, corpus: &Corpus) -> anyhow::Result<()> {
        if !corpus.records.is_empty() {
            self.engine.upsert(&corpus.records).await?;
        }
        if !corpus.documents.is_empty() {
            self.engine.index_documents(&corpus.documents).await?;
        }
        info!(records = corpus.records.len(), documents = corpus.documents.len(), "corpus indexed");
        Ok(())
    }
}
