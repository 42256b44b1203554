//! Dense vector index abstraction
//!
//! Local mode keeps vectors in LanceDB under the storage root; cloud mode
//! keeps them in a remote Qdrant collection. The engine only sees this trait.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

/// A nearest-neighbor match
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: Uuid,
    /// Cosine similarity in `[-1, 1]`
    pub similarity: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the vector of a memory
    async fn upsert(&self, id: Uuid, embedding: &[f32]) -> Result<()>;

    /// Remove the vector of a memory
    async fn remove(&self, id: Uuid) -> Result<()>;

    /// Nearest neighbors by cosine similarity, best first
    async fn search(&self, embedding: &[f32], limit: usize) -> Result<Vec<VectorHit>>;

    /// Number of stored vectors
    async fn len(&self) -> Result<usize>;

    /// Backend name for stats and logs
    fn backend(&self) -> &'static str;
}

/// Cosine similarity of two vectors; 0 for mismatched or zero-length input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Sort hits best first, breaking ties by id for deterministic output.
pub fn sort_hits(hits: &mut [VectorHit]) {
    hits.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.id.cmp(&b.id))
    });
}
