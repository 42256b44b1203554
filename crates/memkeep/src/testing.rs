//! Test utilities for memkeep - in-memory backends and mocks
//!
//! Everything here is deterministic and needs no network or model download:
//! - `HashingEmbedder` in place of fastembed
//! - `InMemoryVectorIndex` in place of LanceDB/Qdrant
//! - classifiers that count calls or always fail
//! - `test_engine` wiring them into a `MemoryEngine` over a temp dir

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tempfile::TempDir;
use uuid::Uuid;

use crate::classifier::{
    Classifier, ClassifierChain, ClassifierError, ExtractedMemory, GateHints, GateVerdict,
    SensitivityVerdict,
};
use crate::config::Config;
use crate::engine::{EngineParts, MemoryEngine};
use crate::error::{MemkeepError, Result};
use crate::memory::types::{Gate, Sensitivity};
use crate::storage::lexical::LexicalIndex;
use crate::storage::sqlite::MetadataStore;
use crate::storage::vector::{VectorHit, VectorIndex, cosine_similarity, sort_hits};

pub use crate::embedding::HashingEmbedder;

/// Dimensions used by the test fixtures
pub const TEST_DIMENSIONS: usize = 128;

/// Brute-force vector index kept in a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    vectors: DashMap<Uuid, Vec<f32>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.vectors.contains_key(&id)
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, id: Uuid, embedding: &[f32]) -> Result<()> {
        self.vectors.insert(id, embedding.to_vec());
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.vectors.remove(&id);
        Ok(())
    }

    async fn search(&self, embedding: &[f32], limit: usize) -> Result<Vec<VectorHit>> {
        let mut hits: Vec<VectorHit> = self
            .vectors
            .iter()
            .map(|entry| VectorHit {
                id: *entry.key(),
                similarity: cosine_similarity(embedding, entry.value()),
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.vectors.len())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Vector index whose every operation fails, standing in for an outage
#[derive(Debug, Default)]
pub struct FailingVectorIndex;

impl FailingVectorIndex {
    pub fn new() -> Self {
        Self
    }

    fn outage() -> MemkeepError {
        MemkeepError::Storage("vector index unreachable".into())
    }
}

#[async_trait]
impl VectorIndex for FailingVectorIndex {
    async fn upsert(&self, _id: Uuid, _embedding: &[f32]) -> Result<()> {
        Err(Self::outage())
    }

    async fn remove(&self, _id: Uuid) -> Result<()> {
        Err(Self::outage())
    }

    async fn search(&self, _embedding: &[f32], _limit: usize) -> Result<Vec<VectorHit>> {
        Err(Self::outage())
    }

    async fn len(&self) -> Result<usize> {
        Err(Self::outage())
    }

    fn backend(&self) -> &'static str {
        "failing"
    }
}

/// Classifier that answers with fixed verdicts and counts its calls
#[derive(Debug)]
pub struct CountingClassifier {
    gate: GateVerdict,
    sensitivity: SensitivityVerdict,
    extraction: Vec<ExtractedMemory>,
    gate_calls: AtomicUsize,
    sensitivity_calls: AtomicUsize,
}

impl CountingClassifier {
    pub fn new(gate: Gate, confidence: f64, sensitivity: Sensitivity) -> Self {
        Self {
            gate: GateVerdict::new(gate, confidence),
            sensitivity: SensitivityVerdict::new(sensitivity, "fixed verdict"),
            extraction: Vec::new(),
            gate_calls: AtomicUsize::new(0),
            sensitivity_calls: AtomicUsize::new(0),
        }
    }

    /// Candidates returned by every extraction call
    pub fn with_extraction(mut self, extraction: Vec<ExtractedMemory>) -> Self {
        self.extraction = extraction;
        self
    }

    pub fn gate_calls(&self) -> usize {
        self.gate_calls.load(Ordering::SeqCst)
    }

    pub fn sensitivity_calls(&self) -> usize {
        self.sensitivity_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for CountingClassifier {
    async fn classify_gate(
        &self,
        _content: &str,
        _hints: &GateHints,
    ) -> std::result::Result<GateVerdict, ClassifierError> {
        self.gate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.gate.clone())
    }

    async fn classify_sensitivity(
        &self,
        _content: &str,
    ) -> std::result::Result<SensitivityVerdict, ClassifierError> {
        self.sensitivity_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.sensitivity.clone())
    }

    async fn extract_memories(
        &self,
        _transcript: &str,
    ) -> std::result::Result<Vec<ExtractedMemory>, ClassifierError> {
        Ok(self.extraction.clone())
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

/// Classifier that is configured but never answers
#[derive(Debug, Default)]
pub struct FailingClassifier;

#[async_trait]
impl Classifier for FailingClassifier {
    async fn classify_gate(
        &self,
        _content: &str,
        _hints: &GateHints,
    ) -> std::result::Result<GateVerdict, ClassifierError> {
        Err(ClassifierError::Api("503 Service Unavailable".into()))
    }

    async fn classify_sensitivity(
        &self,
        _content: &str,
    ) -> std::result::Result<SensitivityVerdict, ClassifierError> {
        Err(ClassifierError::Api("503 Service Unavailable".into()))
    }

    async fn is_available(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Configuration rooted in `dir`, with background jobs disabled.
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.root = dir.path().to_path_buf();
    config.embedding.dimensions = TEST_DIMENSIONS;
    config.indexing.reconcile_interval_secs = 0;
    config.reflection.interval_minutes = None;
    config
}

/// Assemble an engine over temp storage from the given backends.
pub fn engine_with(
    config: Config,
    chain: ClassifierChain,
    vectors: Arc<dyn VectorIndex>,
) -> MemoryEngine {
    let store = Arc::new(
        MetadataStore::open(&config.storage.metadata_path()).expect("open test metadata store"),
    );
    let lexical =
        Arc::new(LexicalIndex::open(&config.storage.lexical_path()).expect("open test lexical index"));
    let embedder = Arc::new(HashingEmbedder::new(config.embedding.dimensions));
    MemoryEngine::from_parts(
        config,
        EngineParts {
            store,
            embedder,
            vectors,
            lexical,
            chain: Arc::new(chain),
            summarizer: None,
        },
    )
}

/// Heuristic-only engine with in-memory vectors. Keep the `TempDir` alive.
pub fn test_engine() -> (MemoryEngine, TempDir) {
    let dir = TempDir::new().expect("create temp dir");
    let engine = engine_with(
        test_config(&dir),
        ClassifierChain::heuristic_only(),
        Arc::new(InMemoryVectorIndex::new()),
    );
    (engine, dir)
}
