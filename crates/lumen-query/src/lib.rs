//! lumen-query
//!
//! The query processor: cache, single-flight, admission control, a deadline
//! over the vector and data-source fan-out, then merge and confidence scoring.
pub mod admission;
pub mod cache;
mod cancel;
pub mod fingerprint;
pub mod merge;
pub mod processor;
mod tasks;

pub use cache::MemoryCache;
pub use fingerprint::fingerprint;
pub use processor::{ProcessorHealth, QueryProcessor};
pub use tasks::TaskStatus;
