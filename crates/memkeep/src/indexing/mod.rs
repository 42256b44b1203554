//! Second phase of the write saga: embeddings and index postings
//!
//! Runs after the metadata record has committed. Every network-bound step is
//! bounded by a timeout and retried with exponential backoff; exhausting the
//! attempts surfaces as `IndexingLag`, never as a failed save.

pub mod locks;
pub mod reconcile;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::IndexingConfig;
use crate::embedding::Embedder;
use crate::error::{MemkeepError, Result};
use crate::memory::types::Memory;
use crate::storage::lexical::LexicalIndex;
use crate::storage::vector::VectorIndex;

pub use locks::WriteLocks;
pub use reconcile::{ReconcileReport, Reconciler};

pub struct IndexingPipeline {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorIndex>,
    lexical: Arc<LexicalIndex>,
    config: IndexingConfig,
}

impl IndexingPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorIndex>,
        lexical: Arc<LexicalIndex>,
        config: IndexingConfig,
    ) -> Self {
        Self {
            embedder,
            vectors,
            lexical,
            config,
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn vectors(&self) -> &Arc<dyn VectorIndex> {
        &self.vectors
    }

    pub fn lexical(&self) -> &Arc<LexicalIndex> {
        &self.lexical
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs.max(1))
    }

    /// Run `op` under the per-attempt timeout, retrying with backoff.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.max_attempts.max(1);
        let timeout = self.timeout();
        let mut delay = Duration::from_millis(self.config.backoff_ms);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("timed out after {timeout:?}"),
            }
            if attempt < attempts {
                warn!(
                    "{} failed on attempt {}/{}, retrying in {:?}: {}",
                    what, attempt, attempts, delay, last_error
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(MemkeepError::IndexingLag(format!(
            "{what} failed after {attempts} attempts: {last_error}"
        )))
    }

    /// Embed a query string under the indexing timeout (no retries).
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let timeout = self.timeout();
        match tokio::time::timeout(timeout, self.embedder.embed(text)).await {
            Ok(result) => result,
            Err(_) => Err(MemkeepError::Embedding(format!(
                "query embedding timed out after {timeout:?}"
            ))),
        }
    }

    /// Write the dense vector and lexical postings of a memory.
    ///
    /// Returns the embedding so the caller can reuse it for graph linking.
    pub async fn index(&self, memory: &Memory) -> Result<Vec<f32>> {
        let content = memory.content.as_str();
        let embedding = self
            .with_retry("embedding", || self.embedder.embed(content))
            .await?;

        self.with_retry("vector upsert", || self.vectors.upsert(memory.id, &embedding))
            .await?;

        if let Err(e) = self.lexical.upsert(memory.id, content) {
            // A dense entry without postings would be half-searchable.
            if let Err(cleanup) = self.vectors.remove(memory.id).await {
                warn!("Failed to drop vector of {} after lexical failure: {}", memory.id, cleanup);
            }
            return Err(MemkeepError::IndexingLag(format!("lexical upsert failed: {e}")));
        }

        debug!("Indexed memory {} ({} dims)", memory.id, embedding.len());
        Ok(embedding)
    }

    /// Remove a memory from both indices.
    ///
    /// Both removals are attempted; the first failure is returned.
    pub async fn remove(&self, id: Uuid) -> Result<()> {
        let lexical = self.lexical.remove(id).map(|_| ());
        let timeout = self.timeout();
        let dense = match tokio::time::timeout(timeout, self.vectors.remove(id)).await {
            Ok(result) => result,
            Err(_) => Err(MemkeepError::Storage(format!(
                "vector removal timed out after {timeout:?}"
            ))),
        };
        lexical.and(dense)
    }
}
