//! Memory engine facade
//!
//! Wires the classifier chain, sensitivity scanner, metadata store, indexing
//! pipeline, graph, retriever and reflection engine together and exposes
//! every tool and HTTP operation. Saves follow a write-then-reconcile saga:
//! the metadata record commits first, indexing and linking are best effort.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classifier::{ClassifierChain, RemoteClassifier, Summarizer, assign_gate};
use crate::config::{Config, StorageMode};
use crate::embedding::{Embedder, build_embedder};
use crate::error::{MemkeepError, Result};
use crate::graph::{GraphManager, LinkReport};
use crate::indexing::{IndexingPipeline, ReconcileReport, Reconciler, WriteLocks};
use crate::memory::records::{
    EngineWarning, IdentityDocument, JournalEntry, JournalKind, Neighbor, NewRule, Rule,
    RulePatch, WarningKind,
};
use crate::memory::types::{
    Gate, IndexState, MAX_CONTENT_CHARS, Memory, MemoryPatch, SaveRequest, Sensitivity,
    normalize_label, preview,
};
use crate::privacy::{PiiFinding, SensitivityScanner};
use crate::reflection::{ReflectionEngine, ReflectionReport};
use crate::retrieval::{HybridRetriever, SearchRequest, SearchResponse};
use crate::storage::filter::MemoryFilter;
use crate::storage::lexical::{LexicalIndex, tokenize};
use crate::storage::sqlite::{MetadataStore, StoreStats};
use crate::storage::vector::VectorIndex;
use crate::storage::{LanceVectorIndex, QdrantVectorIndex};

/// Largest page returned by `list`
pub const MAX_PAGE_SIZE: usize = 500;

/// Result of a save
#[derive(Debug, Clone, Serialize)]
pub struct SaveOutcome {
    pub memory: Memory,
    /// Degradations that did not fail the save
    pub warnings: Vec<EngineWarning>,
    /// Edges created for the new memory; absent when indexing lagged
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<LinkReport>,
}

/// Result of a content or label edit
#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub memory: Memory,
    pub warnings: Vec<EngineWarning>,
}

/// A memory surfaced by proactive recall
#[derive(Debug, Clone, Serialize)]
pub struct PrimedMemory {
    pub memory: Memory,
    /// See [`crate::retrieval::ScoreTrace::relevance`]
    pub relevance: f64,
}

/// Proactive recall for an incoming message
#[derive(Debug, Clone, Serialize)]
pub struct PrimeResponse {
    /// Ready-to-inject text, one line per memory
    pub context: String,
    pub memories: Vec<PrimedMemory>,
    pub degraded: bool,
}

/// Candidate the extractor proposed but the save path rejected
#[derive(Debug, Clone, Serialize)]
pub struct SkippedCandidate {
    pub content: String,
    pub reason: String,
}

/// Result of saving the memories extracted from a transcript
#[derive(Debug, Clone, Serialize)]
pub struct ExtractReport {
    pub candidates: usize,
    pub saved: Vec<SaveOutcome>,
    pub skipped: Vec<SkippedCandidate>,
}

/// Acknowledgement of a forget
#[derive(Debug, Clone, Serialize)]
pub struct ForgetReceipt {
    pub id: Uuid,
    pub reason: String,
    pub forgotten_at: DateTime<Utc>,
    /// Index removal failed and is queued for reconciliation
    pub index_cleanup_pending: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub items: Vec<Memory>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Outcome of a sensitivity batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensitivityBatchReport {
    pub examined: usize,
    pub safe: usize,
    pub sensitive: usize,
    pub critical: usize,
    pub unclassified: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    #[serde(flatten)]
    pub store: StoreStats,
    pub vector_backend: &'static str,
    /// `None` when the vector backend could not be reached
    pub vector_count: Option<usize>,
    pub lexical_documents: usize,
    pub embedder: &'static str,
    pub classifier: &'static str,
    pub last_reflection: Option<serde_json::Value>,
}

/// Manual sensitivity review
#[derive(Debug, Clone, Deserialize)]
pub struct SensitivityReview {
    pub level: Sensitivity,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Externally built collaborators, for tests and embedders of the library
pub struct EngineParts {
    pub store: Arc<MetadataStore>,
    pub embedder: Arc<dyn Embedder>,
    pub vectors: Arc<dyn VectorIndex>,
    pub lexical: Arc<LexicalIndex>,
    pub chain: Arc<ClassifierChain>,
    pub summarizer: Option<Arc<dyn Summarizer>>,
}

pub struct MemoryEngine {
    config: Config,
    store: Arc<MetadataStore>,
    chain: Arc<ClassifierChain>,
    scanner: SensitivityScanner,
    pipeline: Arc<IndexingPipeline>,
    graph: Arc<GraphManager>,
    retriever: HybridRetriever,
    reflection: ReflectionEngine,
    reconciler: Reconciler,
    locks: Arc<WriteLocks>,
}

const NOTHING_PRIMED: &str = "No relevant memories found.";

fn format_primed(memories: &[PrimedMemory]) -> String {
    if memories.is_empty() {
        return NOTHING_PRIMED.to_string();
    }
    let lines: Vec<String> = memories
        .iter()
        .map(|p| {
            format!(
                "[{}, relevance={:.2}] {}",
                p.memory.gate, p.relevance, p.memory.content
            )
        })
        .collect();
    format!("Relevant context from memory:\n{}", lines.join("\n"))
}

fn validate_content(content: &str) -> Result<String> {
    let content = content.trim();
    if content.is_empty() {
        return Err(MemkeepError::Validation("content must not be empty".into()));
    }
    let chars = content.chars().count();
    if chars > MAX_CONTENT_CHARS {
        return Err(MemkeepError::Validation(format!(
            "content is {chars} characters, the limit is {MAX_CONTENT_CHARS}"
        )));
    }
    Ok(content.to_string())
}

fn not_found(id: Uuid) -> MemkeepError {
    MemkeepError::NotFound(format!("memory {id}"))
}

impl MemoryEngine {
    /// Build every backend named by the configuration.
    pub async fn open(config: Config) -> Result<Self> {
        let storage = &config.storage;
        info!("Opening memkeep store at {}", storage.root.display());
        let store = Arc::new(MetadataStore::open(&storage.metadata_path())?);
        let lexical = Arc::new(LexicalIndex::open(&storage.lexical_path())?);

        let dimensions = config.embedding.dimensions;
        let vectors: Arc<dyn VectorIndex> = match storage.mode {
            StorageMode::Local => {
                Arc::new(LanceVectorIndex::open(&storage.vector_dir(), dimensions).await?)
            }
            StorageMode::Cloud => {
                Arc::new(QdrantVectorIndex::connect(&storage.cloud, dimensions).await?)
            }
        };
        info!("Vector index backend: {}", vectors.backend());

        let embedder = build_embedder(&config.embedding)?;
        let chain = Arc::new(ClassifierChain::from_config(&config.classifier));
        let summarizer: Option<Arc<dyn Summarizer>> = if chain.has_primary() {
            RemoteClassifier::new(&config.classifier)
                .ok()
                .map(|remote| Arc::new(remote) as Arc<dyn Summarizer>)
        } else {
            None
        };

        Ok(Self::from_parts(
            config,
            EngineParts {
                store,
                embedder,
                vectors,
                lexical,
                chain,
                summarizer,
            },
        ))
    }

    pub fn from_parts(config: Config, parts: EngineParts) -> Self {
        let EngineParts {
            store,
            embedder,
            vectors,
            lexical,
            chain,
            summarizer,
        } = parts;

        let pipeline = Arc::new(IndexingPipeline::new(
            embedder,
            Arc::clone(&vectors),
            Arc::clone(&lexical),
            config.indexing.clone(),
        ));
        let graph = Arc::new(GraphManager::new(
            Arc::clone(&store),
            vectors,
            lexical,
            config.graph.clone(),
        ));
        let retriever = HybridRetriever::new(
            Arc::clone(&store),
            Arc::clone(&pipeline),
            Arc::clone(&graph),
            config.retrieval.clone(),
            config.decay.clone(),
        );
        let mut reflection = ReflectionEngine::new(
            Arc::clone(&store),
            config.reflection.clone(),
            config.decay.clone(),
            config.graph.contradiction_penalty,
        );
        if let Some(summarizer) = summarizer {
            reflection = reflection.with_summarizer(summarizer);
        }
        let locks = Arc::new(WriteLocks::new());
        let reconciler = Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&pipeline),
            Arc::clone(&graph),
            Arc::clone(&locks),
        );

        Self {
            scanner: SensitivityScanner::new(Arc::clone(&chain)),
            config,
            store,
            chain,
            pipeline,
            graph,
            retriever,
            reflection,
            reconciler,
            locks,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// Serialize writers of one memory id.
    async fn lock_id(&self, id: Uuid) -> OwnedMutexGuard<()> {
        self.locks.acquire(id).await
    }

    fn require(&self, id: Uuid) -> Result<Memory> {
        self.store.get_memory(id)?.ok_or_else(|| not_found(id))
    }

    // ---------------------------------------------------------------------
    // Tool surface
    // ---------------------------------------------------------------------

    /// Classify, scan and persist new content.
    pub async fn save(&self, request: SaveRequest) -> Result<SaveOutcome> {
        let content = validate_content(&request.content)?;
        let request = SaveRequest {
            content,
            person: normalize_label(request.person),
            project: normalize_label(request.project),
            ..request
        };

        let rules = self.store.list_rules()?;
        let assignment = assign_gate(&self.chain, &request, &rules).await;
        let scan = self.scanner.scan(&request.content).await;

        let mut memory = Memory::new(
            request.content.clone(),
            assignment.gate,
            assignment.scope,
            assignment.confidence,
        );
        memory.person = request.person.clone();
        memory.project = request.project.clone();
        memory.decay_class = request
            .decay_class
            .unwrap_or_else(|| assignment.gate.default_decay_class());
        memory.pinned = request.pinned;
        memory.sensitivity = scan.sensitivity;
        memory.sensitivity_reason = scan.reason.clone();

        let mut warnings = assignment.warnings;
        if scan.degraded {
            warnings.push(EngineWarning::new(
                WarningKind::ClassificationDegraded,
                "sensitivity left unclassified for later review",
            ));
        }
        if matches!(memory.sensitivity, Sensitivity::Sensitive | Sensitivity::Critical) {
            warnings.push(EngineWarning::new(
                WarningKind::SensitiveContent,
                format!(
                    "content flagged {}: {}",
                    memory.sensitivity,
                    scan.reason.as_deref().unwrap_or("no reason given")
                ),
            ));
        }

        self.store.insert_memory(&memory)?;
        info!(
            "Saved memory {} (gate={}, scope={}, confidence={:.1}, source={})",
            memory.id, memory.gate, memory.scope, memory.confidence, assignment.source
        );

        if !assignment.triggered_rules.is_empty() {
            self.store
                .mark_rules_triggered(&assignment.triggered_rules, Utc::now())?;
        }

        let links = self.index_and_link(&mut memory, &mut warnings).await?;
        Ok(SaveOutcome {
            memory,
            warnings,
            links,
        })
    }

    /// Second phase of a write: index, then link. Failures become warnings.
    async fn index_and_link(
        &self,
        memory: &mut Memory,
        warnings: &mut Vec<EngineWarning>,
    ) -> Result<Option<LinkReport>> {
        let embedding = match self.pipeline.index(memory).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!("Indexing of memory {} lagged: {}", memory.id, e);
                self.store.set_index_state(memory.id, IndexState::Failed)?;
                memory.index_state = IndexState::Failed;
                warnings.push(EngineWarning::new(WarningKind::IndexingLag, e.to_string()));
                return Ok(None);
            }
        };
        self.store.set_index_state(memory.id, IndexState::Indexed)?;
        memory.index_state = IndexState::Indexed;

        match self.graph.link_new_memory(memory, &embedding).await {
            Ok(report) => {
                if let Some((existing, similarity)) = report.possible_duplicate {
                    warnings.push(EngineWarning::new(
                        WarningKind::PossibleDuplicate,
                        format!("nearly identical to memory {existing} (similarity {similarity:.3})"),
                    ));
                }
                Ok(Some(report))
            }
            Err(e) => {
                warn!("Linking memory {} failed: {}", memory.id, e);
                Ok(None)
            }
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.retriever.search(request).await
    }

    pub async fn search_at(
        &self,
        request: &SearchRequest,
        now: DateTime<Utc>,
    ) -> Result<SearchResponse> {
        self.retriever.search_at(request, now).await
    }

    /// Proactive recall: the few memories most relevant to `message`.
    ///
    /// Only memories above the relevance floor are returned and touched.
    pub async fn prime(&self, message: &str) -> Result<PrimeResponse> {
        let retrieval = &self.config.retrieval;
        let request = SearchRequest::new(message)
            .with_limit(retrieval.prime_limit)
            .without_touch();
        let response = self.retriever.search(&request).await?;

        let mut memories: Vec<PrimedMemory> = response
            .results
            .into_iter()
            .filter_map(|result| {
                let relevance = result.trace.relevance();
                (relevance >= retrieval.prime_min_relevance).then_some(PrimedMemory {
                    memory: result.memory,
                    relevance,
                })
            })
            .collect();

        if !memories.is_empty() {
            let now = Utc::now();
            let ids: Vec<Uuid> = memories.iter().map(|p| p.memory.id).collect();
            self.store.record_access(&ids, now)?;
            for primed in &mut memories {
                primed.memory.mark_accessed(now);
            }
        }
        debug!("Primed {} memories", memories.len());

        Ok(PrimeResponse {
            context: format_primed(&memories),
            memories,
            degraded: response.degraded,
        })
    }

    /// Save the memories a model finds in a conversation transcript.
    ///
    /// Each candidate goes through the normal save path; candidates the save
    /// rejects are reported, not fatal.
    pub async fn auto_extract(&self, transcript: &str) -> Result<ExtractReport> {
        let transcript = transcript.trim();
        if transcript.is_empty() {
            return Err(MemkeepError::Validation("transcript must not be empty".into()));
        }
        let candidates = self
            .chain
            .extract_memories(transcript)
            .await
            .map_err(|e| {
                MemkeepError::ClassificationDegraded(format!("memory extraction unavailable: {e}"))
            })?;

        let mut report = ExtractReport {
            candidates: candidates.len(),
            saved: Vec::new(),
            skipped: Vec::new(),
        };
        for candidate in candidates {
            let mut request = SaveRequest::new(candidate.content.clone());
            request.gate = candidate.gate.as_deref().and_then(|g| g.parse::<Gate>().ok());
            request.person = candidate.person;
            request.project = candidate.project;
            match self.save(request).await {
                Ok(outcome) => report.saved.push(outcome),
                Err(e) => {
                    warn!("Extracted memory was not saved: {}", e);
                    report.skipped.push(SkippedCandidate {
                        content: preview(&candidate.content),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Auto-extracted {} of {} candidate memories",
            report.saved.len(),
            report.candidates
        );
        Ok(report)
    }

    /// Remove a memory: index entries first (best effort), then the record.
    pub async fn forget(&self, id: Uuid, reason: &str) -> Result<ForgetReceipt> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(MemkeepError::Validation(
                "a reason is required to forget a memory".into(),
            ));
        }
        let guard = self.lock_id(id).await;
        self.require(id)?;

        let now = Utc::now();
        let index_cleanup_pending = match self.pipeline.remove(id).await {
            Ok(()) => false,
            Err(e) => {
                warn!("Index removal of {} failed, queued for reconciliation: {}", id, e);
                self.store.queue_index_removal(id, now)?;
                true
            }
        };

        self.store
            .delete_memory(id, reason, now)?
            .ok_or_else(|| not_found(id))?;
        drop(guard);
        self.locks.release(id);

        info!("Forgot memory {} ({})", id, reason);
        Ok(ForgetReceipt {
            id,
            reason: reason.to_string(),
            forgotten_at: now,
            index_cleanup_pending,
        })
    }

    // ---------------------------------------------------------------------
    // Memories
    // ---------------------------------------------------------------------

    /// Fetch one memory, counting the read as an access.
    pub async fn get(&self, id: Uuid) -> Result<Memory> {
        let now = Utc::now();
        let memory = self.require(id)?;
        if memory.archived && self.config.decay.resurrect_on_access {
            let _guard = self.lock_id(id).await;
            if self
                .store
                .resurrect(id, self.config.decay.resurrect_confidence, now)?
            {
                debug!("Resurrected memory {} on access", id);
            }
        }
        self.store.record_access(&[id], now)?;
        self.require(id)
    }

    pub fn list(&self, filter: &MemoryFilter, limit: usize, offset: usize) -> Result<Page> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        Ok(Page {
            items: self.store.list_memories(filter, limit, offset)?,
            total: self.store.count_memories(filter)?,
            limit,
            offset,
        })
    }

    /// Apply a user edit. Content changes are rescanned and reindexed.
    pub async fn update(&self, id: Uuid, patch: MemoryPatch) -> Result<UpdateOutcome> {
        if patch.is_empty() {
            return Err(MemkeepError::Validation("update changes nothing".into()));
        }
        let new_content = patch.content.as_deref().map(validate_content).transpose()?;

        let _guard = self.lock_id(id).await;
        let mut memory = self.require(id)?;
        let mut warnings = Vec::new();

        let content_changed = new_content
            .as_ref()
            .is_some_and(|content| *content != memory.content);
        if let Some(content) = new_content {
            memory.content = content;
        }
        if let Some(gate) = patch.gate {
            memory.gate = gate;
        }
        if let Some(scope) = patch.scope {
            memory.scope = scope;
        }
        if patch.person.is_some() {
            memory.person = normalize_label(patch.person);
        }
        if patch.project.is_some() {
            memory.project = normalize_label(patch.project);
        }
        if let Some(decay_class) = patch.decay_class {
            memory.decay_class = decay_class;
        }

        if content_changed {
            let scan = self.scanner.scan(&memory.content).await;
            memory.sensitivity = scan.sensitivity;
            memory.sensitivity_reason = scan.reason;
            if scan.degraded {
                warnings.push(EngineWarning::new(
                    WarningKind::ClassificationDegraded,
                    "sensitivity left unclassified for later review",
                ));
            }
            memory.index_state = IndexState::Pending;
        }

        if !self.store.update_memory(&memory)? {
            return Err(not_found(id));
        }

        if content_changed {
            match self.pipeline.index(&memory).await {
                Ok(_) => {
                    self.store.set_index_state(id, IndexState::Indexed)?;
                    memory.index_state = IndexState::Indexed;
                }
                Err(e) => {
                    warn!("Reindex of memory {} lagged: {}", id, e);
                    self.store.set_index_state(id, IndexState::Failed)?;
                    memory.index_state = IndexState::Failed;
                    warnings.push(EngineWarning::new(WarningKind::IndexingLag, e.to_string()));
                }
            }
        }

        Ok(UpdateOutcome {
            memory: self.require(id)?,
            warnings,
        })
    }

    pub async fn pin(&self, id: Uuid) -> Result<Memory> {
        self.set_pinned(id, true).await
    }

    pub async fn unpin(&self, id: Uuid) -> Result<Memory> {
        self.set_pinned(id, false).await
    }

    async fn set_pinned(&self, id: Uuid, pinned: bool) -> Result<Memory> {
        let _guard = self.lock_id(id).await;
        if !self.store.set_pinned(id, pinned, Utc::now())? {
            return Err(not_found(id));
        }
        self.require(id)
    }

    pub fn neighbors(&self, id: Uuid, depth: Option<usize>) -> Result<Vec<Neighbor>> {
        self.graph.neighbors(id, depth.unwrap_or(1))
    }

    // ---------------------------------------------------------------------
    // Sensitivity
    // ---------------------------------------------------------------------

    /// Re-run the scanner over unclassified memories, or all with `force`.
    pub async fn classify_sensitivity(&self, force: bool) -> Result<SensitivityBatchReport> {
        let mut report = SensitivityBatchReport::default();
        for memory in self.store.memories_for_classification(force)? {
            let _guard = self.lock_id(memory.id).await;
            let scan = self.scanner.scan(&memory.content).await;
            self.store
                .set_sensitivity(memory.id, scan.sensitivity, scan.reason.as_deref())?;
            report.examined += 1;
            match scan.sensitivity {
                Sensitivity::Safe => report.safe += 1,
                Sensitivity::Sensitive => report.sensitive += 1,
                Sensitivity::Critical => report.critical += 1,
                Sensitivity::Unclassified => report.unclassified += 1,
            }
        }
        info!(
            "Sensitivity batch: {} examined, {} still unclassified",
            report.examined, report.unclassified
        );
        Ok(report)
    }

    pub async fn set_sensitivity(&self, id: Uuid, review: SensitivityReview) -> Result<Memory> {
        let _guard = self.lock_id(id).await;
        let reason = review.reason.as_deref().map(str::trim).filter(|r| !r.is_empty());
        if !self.store.set_sensitivity(id, review.level, reason)? {
            return Err(not_found(id));
        }
        self.require(id)
    }

    /// Stored memories whose content matches credential or PII patterns.
    pub fn scan_pii(&self) -> Result<Vec<PiiFinding>> {
        Ok(self
            .store
            .memories_for_classification(true)?
            .into_iter()
            .filter_map(|memory| {
                let kinds = SensitivityScanner::pattern_scan(&memory.content);
                (!kinds.is_empty()).then(|| PiiFinding {
                    id: memory.id,
                    kinds,
                    preview: memory.preview(),
                })
            })
            .collect())
    }

    // ---------------------------------------------------------------------
    // Identity, journal, rules
    // ---------------------------------------------------------------------

    pub fn identity(&self) -> Result<IdentityDocument> {
        Ok(self.store.load_identity()?.unwrap_or_default())
    }

    /// Replace the identity document with a user edit.
    ///
    /// Every supplied section becomes manual and survives resynthesis.
    pub fn update_identity(&self, mut document: IdentityDocument) -> Result<IdentityDocument> {
        if document.sections.iter().any(|s| s.title.trim().is_empty()) {
            return Err(MemkeepError::Validation(
                "identity sections need a title".into(),
            ));
        }
        let now = Utc::now();
        for section in &mut document.sections {
            section.manual = true;
        }
        document.updated_at = Some(now);
        document.source_fingerprint = None;
        self.store.store_identity(&document, now)?;
        Ok(document)
    }

    pub fn checkpoint(&self, summary: &str) -> Result<JournalEntry> {
        let summary = validate_content(summary)?;
        let now = Utc::now();
        let id = self
            .store
            .append_journal(JournalKind::Checkpoint, &summary, None, None, None, now)?;
        Ok(JournalEntry {
            id,
            kind: JournalKind::Checkpoint,
            timestamp: now,
            gate: None,
            content: summary,
            person: None,
            project: None,
            period: None,
        })
    }

    pub fn recent_journal(&self, days: i64) -> Result<Vec<JournalEntry>> {
        if days <= 0 {
            return Err(MemkeepError::Validation("days must be positive".into()));
        }
        self.store.journal_since(Utc::now() - Duration::days(days))
    }

    pub fn list_rules(&self) -> Result<Vec<Rule>> {
        self.store.list_rules()
    }

    pub fn create_rule(&self, new_rule: NewRule) -> Result<Rule> {
        let condition = validate_rule_condition(&new_rule.condition)?;
        let rule = Rule {
            id: Uuid::new_v4(),
            condition,
            scope: new_rule.scope,
            enforcement: new_rule.enforcement,
            gate: new_rule.gate,
            created_at: Utc::now(),
            last_triggered: None,
        };
        self.store.upsert_rule(&rule)?;
        info!("Created {} rule {} ({})", rule.enforcement.as_str(), rule.id, rule.condition);
        Ok(rule)
    }

    pub fn update_rule(&self, id: Uuid, patch: RulePatch) -> Result<Rule> {
        let mut rule = self
            .store
            .get_rule(id)?
            .ok_or_else(|| MemkeepError::NotFound(format!("rule {id}")))?;
        if let Some(condition) = patch.condition {
            rule.condition = validate_rule_condition(&condition)?;
        }
        if let Some(scope) = patch.scope {
            rule.scope = scope;
        }
        if let Some(enforcement) = patch.enforcement {
            rule.enforcement = enforcement;
        }
        if patch.gate.is_some() {
            rule.gate = patch.gate;
        }
        self.store.upsert_rule(&rule)?;
        Ok(rule)
    }

    pub fn delete_rule(&self, id: Uuid) -> Result<()> {
        if !self.store.delete_rule(id)? {
            return Err(MemkeepError::NotFound(format!("rule {id}")));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    pub async fn reflect(&self) -> Result<ReflectionReport> {
        self.reflection.reflect().await
    }

    pub async fn reflect_at(&self, now: DateTime<Utc>) -> Result<ReflectionReport> {
        self.reflection.reflect_at(now).await
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconciler
            .run(self.config.indexing.reconcile_batch.max(1))
            .await
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let vectors = self.pipeline.vectors();
        let vector_count = match vectors.len().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!("Vector index unavailable for stats: {}", e);
                None
            }
        };
        Ok(EngineStats {
            store: self.store.stats()?,
            vector_backend: vectors.backend(),
            vector_count,
            lexical_documents: self.pipeline.lexical().len()?,
            embedder: self.pipeline.embedder().name(),
            classifier: self.chain.primary_name(),
            last_reflection: self.store.last_reflection_report()?,
        })
    }

    /// Start the periodic reconciliation and (if configured) reflection jobs.
    pub fn spawn_background_jobs(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let reconcile_secs = self.config.indexing.reconcile_interval_secs;
        if reconcile_secs > 0 {
            let engine = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(StdDuration::from_secs(reconcile_secs));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = engine.reconcile().await {
                        error!("Background reconciliation failed: {}", e);
                    }
                }
            }));
        }

        if let Some(minutes) = self.config.reflection.interval_minutes.filter(|m| *m > 0) {
            let engine = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(StdDuration::from_secs(minutes * 60));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match engine.reflect().await {
                        Ok(_) => {}
                        Err(MemkeepError::ReflectionInProgress) => {
                            debug!("Skipping scheduled reflection, a cycle is running");
                        }
                        Err(e) => error!("Scheduled reflection failed: {}", e),
                    }
                }
            }));
        }

        handles
    }
}

fn validate_rule_condition(condition: &str) -> Result<String> {
    let condition = condition.trim();
    if tokenize(condition).is_empty() {
        return Err(MemkeepError::Validation(format!(
            "rule condition '{}' has no matchable words",
            preview(condition)
        )));
    }
    Ok(condition.to_string())
}
