use parking_lot::Mutex;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Value};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::debug;

use lumen_core::types::Metadata;
use lumen_core::{Error, Result};

use crate::tantivy_utils::{build_schema, register_tokenizer, terms};

const PROVIDER: &str = "keyword";
const WRITER_HEAP_BYTES: usize = 50_000_000;
// Extra candidates pulled from tantivy so the exact-phrase boost can reorder them.
const CANDIDATE_FACTOR: usize = 4;

/// Text plus metadata written alongside a vector record.
#[derive(Debug, Clone)]
pub struct KeywordDoc {
	pub id: String,
	pub text: String,
	pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeywordHit {
	pub id: String,
	pub score: f32,
	pub metadata: Metadata,
}

/// BM25 keyword index held entirely in RAM.
pub struct KeywordIndex {
	index: Index,
	reader: IndexReader,
	writer: Mutex<IndexWriter>,
	id_field: Field,
	text_field: Field,
	metadata_field: Field,
	exact_match_boost: f32,
}

fn index_error(e: impl ToString) -> Error {
	Error::backend(PROVIDER, e)
}

impl KeywordIndex {
	pub fn new(exact_match_boost: f32) -> Result<Self> {
		let schema = build_schema();
		let index = Index::create_in_ram(schema.clone());
		register_tokenizer(&index);
		let id_field = schema.get_field("id").map_err(index_error)?;
		let text_field = schema.get_field("text").map_err(index_error)?;
		let metadata_field = schema.get_field("metadata").map_err(index_error)?;
		let writer = index.writer_with_num_threads(1, WRITER_HEAP_BYTES).map_err(index_error)?;
		let reader = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into().map_err(index_error)?;
		Ok(Self { index, reader, writer: Mutex::new(writer), id_field, text_field, metadata_field, exact_match_boost })
	}

	pub fn len(&self) -> usize {
		self.reader.searcher().num_docs() as usize
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Insert or replace documents by id.
	pub fn upsert(&self, docs: &[KeywordDoc]) -> Result<()> {
		if docs.is_empty() {
			return Ok(());
		}
		let encoded = docs
			.iter()
			.map(|d| serde_json::to_string(&d.metadata).map(|m| (d, m)))
			.collect::<std::result::Result<Vec<_>, _>>()
			.map_err(index_error)?;
		let mut writer = self.writer.lock();
		for (d, metadata) in encoded {
			writer.delete_term(Term::from_field_text(self.id_field, &d.id));
			writer
				.add_document(doc!(
					self.id_field => d.id.clone(),
					self.text_field => d.text.clone(),
					self.metadata_field => metadata,
				))
				.map_err(index_error)?;
		}
		writer.commit().map_err(index_error)?;
		drop(writer);
		self.reader.reload().map_err(index_error)?;
		debug!(docs = docs.len(), "keyword index updated");
		Ok(())
	}

	pub fn delete(&self, ids: &[String]) -> Result<()> {
		if ids.is_empty() {
			return Ok(());
		}
		let mut writer = self.writer.lock();
		for id in ids {
			writer.delete_term(Term::from_field_text(self.id_field, id));
		}
		writer.commit().map_err(index_error)?;
		drop(writer);
		self.reader.reload().map_err(index_error)
	}

	/// Top `k` documents for `query`, highest score first, ties by id.
	///
	/// Syntax errors in the query are tolerated; documents containing the
	/// whole query as a phrase get `exact_match_boost` added to their BM25
	/// score.
	pub fn search(&self, query: &str, k: usize) -> Result<Vec<KeywordHit>> {
		let phrase = terms(query);
		if k == 0 || phrase.is_empty() {
			return Ok(Vec::new());
		}
		let searcher = self.reader.searcher();
		let parser = QueryParser::for_index(&self.index, vec![self.text_field]);
		let (parsed, errors) = parser.parse_query_lenient(query);
		if !errors.is_empty() {
			debug!(errors = errors.len(), "keyword query parsed leniently");
		}
		let top_docs = searcher.search(&parsed, &TopDocs::with_limit(k.saturating_mul(CANDIDATE_FACTOR))).map_err(index_error)?;

		let mut hits = Vec::with_capacity(top_docs.len());
		for (score, addr) in top_docs {
			let doc: TantivyDocument = searcher.doc(addr).map_err(index_error)?;
			let id = doc.get_first(self.id_field).and_then(|v| v.as_str()).unwrap_or("").to_string();
			let text = doc.get_first(self.text_field).and_then(|v| v.as_str()).unwrap_or("");
			let metadata: Metadata = doc
				.get_first(self.metadata_field)
				.and_then(|v| v.as_str())
				.and_then(|s| serde_json::from_str(s).ok())
				.unwrap_or_default();
			let doc_terms = terms(text);
			let exact = doc_terms.windows(phrase.len()).any(|w| w == phrase.as_slice());
			let score = if exact { score + self.exact_match_boost } else { score };
			hits.push(KeywordHit { id, score, metadata });
		}
		hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
		hits.truncate(k);
		Ok(hits)
	}
}
