//! Vector index backends behind one [`VectorIndexBackend`] contract.
//!
//! - `flat`: in-process exact index
//! - `remote_collection`: Qdrant-style collection store over REST
//! - `managed`: Pinecone-style managed index over REST
//!
//! All providers normalize their native scores into `[0, 1]` (see `score`).
pub mod backend;
pub mod flat;
pub mod managed;
pub mod remote_collection;
pub mod score;
mod rest;

pub use backend::build_backend;
pub use flat::FlatIndex;
pub use lumen_core::traits::VectorIndexBackend;
pub use managed::ManagedIndex;
pub use remote_collection::RemoteCollection;
