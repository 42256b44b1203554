//! Hybrid retrieval
//!
//! Dense nearest neighbors and BM25 run independently, are fused with
//! Reciprocal Rank Fusion, hydrated from the metadata store, reweighted by
//! current confidence and recency, filtered and truncated. Every result
//! carries a trace of how it scored.

pub mod fusion;

use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{DecayConfig, RetrievalConfig};
use crate::error::{MemkeepError, Result};
use crate::graph::GraphManager;
use crate::indexing::IndexingPipeline;
use crate::memory::records::{EngineWarning, Neighbor, WarningKind};
use crate::memory::types::{IndexState, Memory};
use crate::storage::filter::MemoryFilter;
use crate::storage::sqlite::MetadataStore;

pub use fusion::{
    Contribution, FusedCandidate, MatchSource, RankedList, reciprocal_rank_fusion,
};

/// Upper bound on results per query
pub const MAX_LIMIT: usize = 200;

/// Search input
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub filters: MemoryFilter,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Attach graph neighbors up to this depth to every result
    #[serde(default)]
    pub expand_depth: Option<usize>,
    /// Overrides `retrieval.touch_on_read` for this query
    #[serde(default)]
    pub touch: Option<bool>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_filters(mut self, filters: MemoryFilter) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_neighbors(mut self, depth: usize) -> Self {
        self.expand_depth = Some(depth);
        self
    }

    pub fn without_touch(mut self) -> Self {
        self.touch = Some(false);
        self
    }
}

/// Provenance of one result
#[derive(Debug, Clone, Serialize)]
pub struct ScoreTrace {
    /// Lists the memory matched, with rank and raw score
    pub contributions: Vec<Contribution>,
    pub fused_score: f64,
    pub confidence_factor: f64,
    pub recency_boost: f64,
    pub final_score: f64,
}

impl ScoreTrace {
    pub fn matched(&self, source: MatchSource) -> bool {
        self.contributions.iter().any(|c| c.source == source)
    }

    pub fn raw_score(&self, source: MatchSource) -> Option<f64> {
        self.contributions
            .iter()
            .find(|c| c.source == source)
            .map(|c| c.raw_score)
    }

    /// Absolute relevance in `[0, 1]`, unlike the rank-based fused score:
    /// the larger of the dense cosine similarity and the saturated BM25 score.
    pub fn relevance(&self) -> f64 {
        let dense = self
            .raw_score(MatchSource::Dense)
            .map(|s| s.clamp(0.0, 1.0))
            .unwrap_or(0.0);
        let lexical = self
            .raw_score(MatchSource::Lexical)
            .map(|s| s.max(0.0) / (s.max(0.0) + 1.0))
            .unwrap_or(0.0);
        dense.max(lexical)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub memory: Memory,
    pub trace: ScoreTrace,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub neighbors: Vec<Neighbor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
    /// One of the two retrieval lists was unavailable
    pub degraded: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<EngineWarning>,
}

/// Multiplier from current confidence, in `[0.5, 1.0]`
pub fn confidence_factor(confidence: f64) -> f64 {
    0.5 + 0.5 * (confidence.clamp(0.0, 100.0) / 100.0)
}

/// Multiplier favoring memories created within the window, in `[1, 1 + max_boost]`
pub fn recency_boost(
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    window_hours: f64,
    max_boost: f64,
) -> f64 {
    if window_hours <= 0.0 {
        return 1.0;
    }
    let age_hours = (now - created_at).num_milliseconds().max(0) as f64 / 3_600_000.0;
    1.0 + max_boost * (1.0 - age_hours / window_hours).max(0.0)
}

pub struct HybridRetriever {
    store: Arc<MetadataStore>,
    pipeline: Arc<IndexingPipeline>,
    graph: Arc<GraphManager>,
    config: RetrievalConfig,
    decay: DecayConfig,
    query_cache: Option<Mutex<LruCache<String, Vec<f32>>>>,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<MetadataStore>,
        pipeline: Arc<IndexingPipeline>,
        graph: Arc<GraphManager>,
        config: RetrievalConfig,
        decay: DecayConfig,
    ) -> Self {
        let query_cache = NonZeroUsize::new(config.query_cache_size)
            .map(|size| Mutex::new(LruCache::new(size)));
        Self {
            store,
            pipeline,
            graph,
            config,
            decay,
            query_cache,
        }
    }

    async fn query_embedding(&self, query: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.query_cache {
            if let Some(hit) = cache.lock().get(query) {
                return Ok(hit.clone());
            }
        }
        let embedding = self.pipeline.embed_query(query).await?;
        if let Some(cache) = &self.query_cache {
            cache.lock().put(query.to_string(), embedding.clone());
        }
        Ok(embedding)
    }

    async fn dense_list(&self, query: &str, pool: usize) -> Result<RankedList> {
        let embedding = self.query_embedding(query).await?;
        let hits = self.pipeline.vectors().search(&embedding, pool).await?;
        Ok(RankedList::new(
            MatchSource::Dense,
            hits.into_iter()
                .map(|h| (h.id, f64::from(h.similarity)))
                .collect(),
        ))
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.search_at(request, Utc::now()).await
    }

    /// Run a search as of `now`.
    pub async fn search_at(
        &self,
        request: &SearchRequest,
        now: DateTime<Utc>,
    ) -> Result<SearchResponse> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(MemkeepError::Validation("query must not be empty".into()));
        }
        let limit = request.limit.unwrap_or(self.config.default_limit);
        if limit == 0 {
            return Err(MemkeepError::Validation("limit must be at least 1".into()));
        }
        let limit = limit.min(MAX_LIMIT);
        let pool = (limit * self.config.candidate_multiplier).max(self.config.min_candidates);

        let mut warnings = Vec::new();
        let mut lists = Vec::with_capacity(2);

        match self.dense_list(query, pool).await {
            Ok(list) => lists.push(list),
            Err(e) => {
                warn!("Dense retrieval unavailable, using lexical only: {}", e);
                warnings.push(EngineWarning::new(
                    WarningKind::IndexingLag,
                    format!("dense retrieval unavailable: {e}"),
                ));
            }
        }

        match self.pipeline.lexical().search(query, pool) {
            Ok(hits) => lists.push(RankedList::new(
                MatchSource::Lexical,
                hits.into_iter().map(|h| (h.id, h.score)).collect(),
            )),
            Err(e) if !lists.is_empty() => {
                warn!("Lexical retrieval unavailable, using dense only: {}", e);
                warnings.push(EngineWarning::new(
                    WarningKind::IndexingLag,
                    format!("lexical retrieval unavailable: {e}"),
                ));
            }
            Err(e) => return Err(e),
        }

        let fused = reciprocal_rank_fusion(&lists, self.config.rrf_k);
        let ids: Vec<Uuid> = fused.iter().map(|c| c.id).collect();
        // Entries whose record is gone (forgotten) or whose indexing has not
        // completed drop out here.
        let mut hydrated = self.store.get_memories(&ids)?;

        let mut results: Vec<SearchResult> = fused
            .into_iter()
            .filter_map(|candidate| {
                let memory = hydrated.remove(&candidate.id)?;
                if memory.index_state != IndexState::Indexed || !request.filters.matches(&memory) {
                    return None;
                }
                let confidence_factor = confidence_factor(memory.confidence);
                let recency_boost = recency_boost(
                    memory.created_at,
                    now,
                    self.config.recency_window_hours,
                    self.config.recency_max_boost,
                );
                let final_score = candidate.fused_score * confidence_factor * recency_boost;
                Some(SearchResult {
                    memory,
                    trace: ScoreTrace {
                        contributions: candidate.contributions,
                        fused_score: candidate.fused_score,
                        confidence_factor,
                        recency_boost,
                        final_score,
                    },
                    neighbors: Vec::new(),
                })
            })
            .collect();

        results.sort_by(|a, b| {
            b.trace
                .final_score
                .total_cmp(&a.trace.final_score)
                .then_with(|| b.trace.fused_score.total_cmp(&a.trace.fused_score))
                .then_with(|| b.memory.confidence.total_cmp(&a.memory.confidence))
                .then_with(|| b.memory.last_accessed.cmp(&a.memory.last_accessed))
                .then_with(|| a.memory.id.cmp(&b.memory.id))
        });
        results.truncate(limit);

        if self.decay.resurrect_on_access {
            for result in results.iter_mut().filter(|r| r.memory.archived) {
                if self.store.resurrect(
                    result.memory.id,
                    self.decay.resurrect_confidence,
                    now,
                )? {
                    debug!("Resurrected memory {} on search hit", result.memory.id);
                    result.memory.archived = false;
                    result.memory.set_confidence(
                        result.memory.confidence.max(self.decay.resurrect_confidence),
                    );
                }
            }
        }

        let touch = request.touch.unwrap_or(self.config.touch_on_read);
        if touch && !results.is_empty() {
            let touched: Vec<Uuid> = results.iter().map(|r| r.memory.id).collect();
            self.store.record_access(&touched, now)?;
            for result in &mut results {
                result.memory.mark_accessed(now);
            }
        }

        if let Some(depth) = request.expand_depth {
            for result in &mut results {
                result.neighbors = self.graph.neighbors(result.memory.id, depth)?;
            }
        }

        debug!(
            "Search '{}' returned {} results ({} lists)",
            query,
            results.len(),
            lists.len()
        );

        Ok(SearchResponse {
            query: query.to_string(),
            results,
            degraded: lists.len() < 2,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GraphConfig, IndexingConfig};
    use crate::memory::types::{Gate, Scope};
    use crate::storage::lexical::LexicalIndex;
    use crate::storage::vector::VectorIndex;
    use crate::testing::{FailingVectorIndex, HashingEmbedder, InMemoryVectorIndex};
    use chrono::Duration;
    use tempfile::TempDir;

    struct Fixture {
        retriever: HybridRetriever,
        store: Arc<MetadataStore>,
        pipeline: Arc<IndexingPipeline>,
        _dir: TempDir,
    }

    fn create_fixture_with(vectors: Arc<dyn VectorIndex>, decay: DecayConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MetadataStore::open(&dir.path().join("memkeep.db")).unwrap());
        let lexical = Arc::new(LexicalIndex::open(&dir.path().join("lexical.db")).unwrap());
        let indexing = IndexingConfig {
            max_attempts: 1,
            backoff_ms: 1,
            ..Default::default()
        };
        let pipeline = Arc::new(IndexingPipeline::new(
            Arc::new(HashingEmbedder::new(128)),
            Arc::clone(&vectors),
            Arc::clone(&lexical),
            indexing,
        ));
        let graph = Arc::new(GraphManager::new(
            Arc::clone(&store),
            vectors,
            lexical,
            GraphConfig::default(),
        ));
        let retriever = HybridRetriever::new(
            Arc::clone(&store),
            Arc::clone(&pipeline),
            graph,
            RetrievalConfig::default(),
            decay,
        );
        Fixture {
            retriever,
            store,
            pipeline,
            _dir: dir,
        }
    }

    fn create_fixture() -> Fixture {
        create_fixture_with(Arc::new(InMemoryVectorIndex::new()), DecayConfig::default())
    }

    impl Fixture {
        async fn add(&self, content: &str, gate: Gate, confidence: f64) -> Memory {
            let memory = Memory::new(content, gate, Scope::User, confidence);
            self.store.insert_memory(&memory).unwrap();
            self.pipeline.index(&memory).await.unwrap();
            self.store
                .set_index_state(memory.id, IndexState::Indexed)
                .unwrap();
            self.store.get_memory(memory.id).unwrap().unwrap()
        }
    }

    mod scoring {
        use super::*;

        #[test]
        fn test_confidence_factor_bounds() {
            assert_eq!(confidence_factor(0.0), 0.5);
            assert_eq!(confidence_factor(100.0), 1.0);
            assert_eq!(confidence_factor(250.0), 1.0);
        }

        #[test]
        fn test_recency_boost_decays_over_window() {
            let now = Utc::now();
            assert!((recency_boost(now, now, 48.0, 0.2) - 1.2).abs() < 1e-9);
            let half = recency_boost(now - Duration::hours(24), now, 48.0, 0.2);
            assert!((half - 1.1).abs() < 1e-9);
            assert_eq!(recency_boost(now - Duration::hours(72), now, 48.0, 0.2), 1.0);
        }
    }

    mod search {
        use super::*;

        #[tokio::test]
        async fn test_dark_mode_ranks_first_with_lexical_match() {
            let fx = create_fixture();
            let target = fx.add("user prefers dark mode", Gate::Behavioral, 76.0).await;
            fx.add("the api listens on port 8080", Gate::Epistemic, 80.0).await;
            fx.add("Alice owns the billing service", Gate::Relational, 80.0).await;

            let response = fx
                .retriever
                .search(&SearchRequest::new("dark mode"))
                .await
                .unwrap();
            assert!(!response.degraded);
            let top = &response.results[0];
            assert_eq!(top.memory.id, target.id);
            assert!(top.trace.matched(MatchSource::Lexical));
            assert!(top.trace.raw_score(MatchSource::Lexical).unwrap() > 0.0);
            assert_eq!(top.memory.access_count, 1);

            let stored = fx.store.get_memory(target.id).unwrap().unwrap();
            assert_eq!(stored.access_count, 1);
        }

        #[tokio::test]
        async fn test_unfinished_indexing_is_hidden() {
            let fx = create_fixture();
            let memory = fx.add("the wiki lives on confluence", Gate::Epistemic, 70.0).await;
            // both indices still hold entries, but the last write failed
            fx.store
                .set_index_state(memory.id, IndexState::Failed)
                .unwrap();

            let response = fx
                .retriever
                .search(&SearchRequest::new("confluence wiki"))
                .await
                .unwrap();
            assert!(response.results.is_empty());

            fx.store
                .set_index_state(memory.id, IndexState::Indexed)
                .unwrap();
            let response = fx
                .retriever
                .search(&SearchRequest::new("confluence wiki"))
                .await
                .unwrap();
            assert_eq!(response.results.len(), 1);
        }

        #[tokio::test]
        async fn test_confidence_breaks_near_ties() {
            let fx = create_fixture();
            let low = fx.add("deploys happen on tuesday", Gate::Epistemic, 20.0).await;
            let high = fx.add("deploys happen on tuesday", Gate::Epistemic, 90.0).await;

            let response = fx
                .retriever
                .search(&SearchRequest::new("deploys tuesday"))
                .await
                .unwrap();
            assert_eq!(response.results[0].memory.id, high.id);
            assert_eq!(response.results[1].memory.id, low.id);
        }

        #[tokio::test]
        async fn test_filters_and_limit() {
            let fx = create_fixture();
            fx.add("user prefers dark mode", Gate::Behavioral, 70.0).await;
            let fact = fx.add("dark mode ships in release 2.3", Gate::Epistemic, 70.0).await;

            let request = SearchRequest::new("dark mode")
                .with_filters(MemoryFilter::new().with_gates(vec![Gate::Epistemic]));
            let response = fx.retriever.search(&request).await.unwrap();
            assert_eq!(response.results.len(), 1);
            assert_eq!(response.results[0].memory.id, fact.id);

            let limited = fx
                .retriever
                .search(&SearchRequest::new("dark mode").with_limit(1))
                .await
                .unwrap();
            assert_eq!(limited.results.len(), 1);
        }

        #[tokio::test]
        async fn test_forgotten_memories_never_returned() {
            let fx = create_fixture();
            let memory = fx.add("user prefers dark mode", Gate::Behavioral, 70.0).await;
            // index entries intentionally left behind
            fx.store
                .delete_memory(memory.id, "test", Utc::now())
                .unwrap();

            let response = fx
                .retriever
                .search(&SearchRequest::new("dark mode"))
                .await
                .unwrap();
            assert!(response.results.iter().all(|r| r.memory.id != memory.id));
        }

        #[tokio::test]
        async fn test_dense_failure_degrades_to_lexical() {
            let fx = create_fixture_with(Arc::new(FailingVectorIndex::new()), DecayConfig::default());
            let memory = Memory::new("user prefers dark mode", Gate::Behavioral, Scope::User, 70.0);
            fx.store.insert_memory(&memory).unwrap();
            fx.pipeline.lexical().upsert(memory.id, &memory.content).unwrap();

            let response = fx
                .retriever
                .search(&SearchRequest::new("dark mode"))
                .await
                .unwrap();
            assert!(response.degraded);
            assert_eq!(response.warnings[0].kind, WarningKind::IndexingLag);
            assert_eq!(response.results.len(), 1);
            assert!(!response.results[0].trace.matched(MatchSource::Dense));
        }

        #[tokio::test]
        async fn test_rejects_empty_query() {
            let fx = create_fixture();
            let err = fx.retriever.search(&SearchRequest::new("  ")).await.unwrap_err();
            assert_eq!(err.kind(), "validation_error");
            let err = fx
                .retriever
                .search(&SearchRequest::new("x").with_limit(0))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "validation_error");
        }
    }

    mod archive {
        use super::*;
        use crate::storage::sqlite::DecayUpdate;

        async fn archived_fixture(resurrect: bool) -> (Fixture, Memory) {
            let decay = DecayConfig {
                resurrect_on_access: resurrect,
                ..Default::default()
            };
            let fx = create_fixture_with(Arc::new(InMemoryVectorIndex::new()), decay);
            let memory = fx.add("the old build used make", Gate::Epistemic, 40.0).await;
            fx.store
                .apply_decay_batch(
                    &[DecayUpdate {
                        id: memory.id,
                        confidence: 5.0,
                        archive: true,
                        observed_confidence: memory.confidence,
                        observed_last_accessed: None,
                    }],
                    Utc::now(),
                )
                .unwrap();
            (fx, memory)
        }

        #[tokio::test]
        async fn test_archived_hidden_by_default() {
            let (fx, memory) = archived_fixture(false).await;
            let hidden = fx
                .retriever
                .search(&SearchRequest::new("build make"))
                .await
                .unwrap();
            assert!(hidden.results.is_empty());

            let request = SearchRequest::new("build make")
                .with_filters(MemoryFilter::new().including_archived());
            let shown = fx.retriever.search(&request).await.unwrap();
            assert_eq!(shown.results[0].memory.id, memory.id);
            assert!(fx.store.get_memory(memory.id).unwrap().unwrap().archived);
        }

        #[tokio::test]
        async fn test_resurrection_on_access() {
            let (fx, memory) = archived_fixture(true).await;
            let request = SearchRequest::new("build make")
                .with_filters(MemoryFilter::new().including_archived());
            let response = fx.retriever.search(&request).await.unwrap();
            assert!(!response.results[0].memory.archived);

            let stored = fx.store.get_memory(memory.id).unwrap().unwrap();
            assert!(!stored.archived);
            assert_eq!(stored.confidence, 30.0);
        }
    }
}
