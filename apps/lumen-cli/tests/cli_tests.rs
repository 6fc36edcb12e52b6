use std::io::Write;

use lumen_cli::{build, load_corpus};
use lumen_core::config::{AppConfig, BackendConfig, EmbeddingConfig};
use lumen_core::types::Query;

fn app(dimension: usize) -> AppConfig {
    AppConfig {
        vector: BackendConfig::flat(dimension),
        embedding: EmbeddingConfig { dimension, ..EmbeddingConfig::default() },
        ..AppConfig::default()
    }
}

fn write_docs(lines: &[&str]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    for line in lines {
        writeln!(file, "{line}").expect("write");
    }
    file
}

#[test]
fn corpus_splits_text_and_vector_lines() {
    let file = write_docs(&[
        r#"{"id": "a", "text": "rust vector search", "metadata": {"title": "A"}}"#,
        "",
        r#"{"id": "b", "vector": [0.1, 0.2, 0.3]}"#,
    ]);
    let corpus = load_corpus(file.path()).unwrap();
    assert_eq!(corpus.len(), 2);
    assert_eq!(corpus.documents[0].id, "a");
    assert_eq!(corpus.records[0].vector.len(), 3);
}

#[test]
fn corpus_reports_the_bad_line() {
    let file = write_docs(&[r#"{"id": "a", "text": "ok"}"#, r#"{"id": "b"}"#]);
    let err = load_corpus(file.path()).unwrap_err().to_string();
    assert!(err.contains(":2:"), "{err}");
}

#[tokio::test]
async fn end_to_end_query_over_hash_embeddings() {
    let runtime = build(&app(128)).await.expect("runtime");
    let file = write_docs(&[
        r#"{"id": "rust", "text": "rust async runtime and vector search engine", "metadata": {"title": "Rust search"}}"#,
        r#"{"id": "bread", "text": "baking sourdough bread with a long fermentation"}"#,
    ]);
    runtime.ingest(&load_corpus(file.path()).unwrap()).await.unwrap();

    let result = runtime.processor.process(Query::new("vector search engine")).await.unwrap();
    assert_eq!(result.results[0].content_id, "rust");
    assert_eq!(result.results[0].source_id, "vector-index");
    assert!(!result.cached);

    let stats = runtime.engine.stats().await.unwrap();
    assert_eq!(stats.index.total_vectors, 2);
    assert!(runtime.processor.health().await.backend.healthy);
}

#[tokio::test]
async fn mismatched_embedding_dimension_fails_to_build() {
    let mut cfg = app(64);
    cfg.embedding.dimension = 32;
    assert!(build(&cfg).await.is_err());
}
