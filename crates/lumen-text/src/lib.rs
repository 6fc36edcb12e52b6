//! lumen-text
//!
//! In-memory tantivy keyword index used as the lexical half of hybrid search.
pub mod tantivy_utils;
pub mod index;

pub use index::{KeywordDoc, KeywordHit, KeywordIndex};
pub use tantivy_utils::terms;
