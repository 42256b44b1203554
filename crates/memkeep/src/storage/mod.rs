//! Persistence layer
//!
//! The SQLite metadata store is authoritative. The dense vector index
//! (LanceDB locally, Qdrant in cloud mode) and the BM25 lexical index are
//! derived and can be rebuilt from it.

pub mod filter;
pub mod lance;
pub mod lexical;
pub mod qdrant;
pub mod sqlite;
pub mod vector;

pub use filter::MemoryFilter;
pub use lance::LanceVectorIndex;
pub use lexical::{LexicalHit, LexicalIndex, tokenize};
pub use qdrant::QdrantVectorIndex;
pub use sqlite::{DecayUpdate, MetadataStore, PenaltyOutcome, StoreStats};
pub use vector::{VectorHit, VectorIndex, cosine_similarity};
