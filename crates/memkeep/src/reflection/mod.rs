//! Reflection cycle: decay, contradiction resolution, journal consolidation
//! and identity synthesis
//!
//! A cycle holds a cooperative lock so two runs never overlap, but ordinary
//! reads and writes proceed during it. Decay works through a snapshot of
//! candidate ids taken at cycle start, one committed batch at a time. Every
//! step is idempotent: running a cycle twice at the same instant changes
//! nothing the second time.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::Summarizer;
use crate::config::{DecayConfig, ReflectionConfig};
use crate::error::{MemkeepError, Result};
use crate::memory::records::{IdentityDocument, IdentitySection, JournalEntry};
use crate::memory::types::{Gate, Memory};
use crate::storage::sqlite::{DecayUpdate, MetadataStore, PenaltyOutcome};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecayReport {
    /// Size of the candidate snapshot
    pub candidates: usize,
    pub decayed: usize,
    pub archived: usize,
    /// Candidates with no elapsed time since their last decay or access
    pub unchanged: usize,
    pub batches_committed: usize,
    pub batches_failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContradictionReport {
    pub processed: usize,
    pub applied: usize,
    pub skipped_pinned: usize,
    pub already_resolved: usize,
    pub missing: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JournalReport {
    pub entries_digested: usize,
    /// ISO weeks that received a digest
    pub periods: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityReport {
    pub regenerated: bool,
    pub sections: usize,
    pub source_memories: usize,
}

/// Outcome of one reflection cycle, recorded in the reflection audit table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub decay: DecayReport,
    pub contradictions: ContradictionReport,
    pub journal: JournalReport,
    pub identity: IdentityReport,
    /// Per-batch or per-step failures that did not abort the cycle
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Confidence after `elapsed_hours` of exponential decay
pub fn decayed_confidence(confidence: f64, elapsed_hours: f64, half_life_hours: f64) -> f64 {
    if elapsed_hours <= 0.0 || half_life_hours <= 0.0 {
        return confidence;
    }
    confidence * 0.5_f64.powf(elapsed_hours / half_life_hours)
}

/// ISO week key of a timestamp, e.g. `2026-W07`
pub fn iso_week(ts: DateTime<Utc>) -> String {
    ts.format("%G-W%V").to_string()
}

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 3_600_000.0
}

/// FNV-1a over the ids and content of the memories behind generated sections
fn fingerprint(memories: &[&Memory]) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for memory in memories {
        for byte in memory
            .id
            .as_bytes()
            .iter()
            .chain(memory.content.as_bytes())
            .chain(std::iter::once(&0u8))
        {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    }
    format!("{hash:016x}")
}

pub struct ReflectionEngine {
    store: Arc<MetadataStore>,
    config: ReflectionConfig,
    decay: DecayConfig,
    contradiction_penalty: f64,
    summarizer: Option<Arc<dyn Summarizer>>,
    cycle_lock: Mutex<()>,
}

impl ReflectionEngine {
    pub fn new(
        store: Arc<MetadataStore>,
        config: ReflectionConfig,
        decay: DecayConfig,
        contradiction_penalty: f64,
    ) -> Self {
        Self {
            store,
            config,
            decay,
            contradiction_penalty,
            summarizer: None,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Pass identity sections through a narrative summarizer.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn is_running(&self) -> bool {
        self.cycle_lock.try_lock().is_err()
    }

    pub async fn reflect(&self) -> Result<ReflectionReport> {
        self.reflect_at(Utc::now()).await
    }

    /// Run one cycle as of `now`.
    pub async fn reflect_at(&self, now: DateTime<Utc>) -> Result<ReflectionReport> {
        let _guard = self
            .cycle_lock
            .try_lock()
            .map_err(|_| MemkeepError::ReflectionInProgress)?;

        let started_at = Utc::now();
        let mut errors = Vec::new();
        info!("Reflection cycle starting (as of {})", now);

        let decay = self.run_decay(now, &mut errors)?;
        let contradictions = self.resolve_contradictions()?;
        let journal = match self.consolidate_journal(now) {
            Ok(report) => report,
            Err(e) => {
                warn!("Journal consolidation failed: {}", e);
                errors.push(format!("journal consolidation: {e}"));
                JournalReport::default()
            }
        };
        let identity = match self.synthesize_identity(now).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Identity synthesis failed: {}", e);
                errors.push(format!("identity synthesis: {e}"));
                IdentityReport::default()
            }
        };

        let report = ReflectionReport {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            decay,
            contradictions,
            journal,
            identity,
            errors,
        };
        self.store.record_reflection_run(
            report.run_id,
            report.started_at,
            report.finished_at,
            &serde_json::to_value(&report)?,
        )?;

        info!(
            "Reflection cycle done: {} decayed, {} archived, {} contradictions applied, {} journal entries digested",
            report.decay.decayed,
            report.decay.archived,
            report.contradictions.applied,
            report.journal.entries_digested
        );
        Ok(report)
    }

    fn decay_updates(&self, memories: &[Memory], now: DateTime<Utc>) -> (Vec<DecayUpdate>, usize) {
        let mut updates = Vec::with_capacity(memories.len());
        let mut unchanged = 0;
        for memory in memories {
            if memory.pinned || memory.archived {
                continue;
            }
            let Some(half_life) = memory.decay_class.half_life_hours(&self.decay) else {
                continue;
            };
            let elapsed = hours_between(memory.decay_anchor(), now);
            if elapsed <= 0.0 {
                unchanged += 1;
                continue;
            }
            let confidence = decayed_confidence(memory.confidence, elapsed, half_life);
            updates.push(DecayUpdate {
                id: memory.id,
                confidence,
                archive: confidence < self.decay.min_confidence,
                observed_confidence: memory.confidence,
                observed_last_accessed: memory.last_accessed,
            });
        }
        (updates, unchanged)
    }

    fn run_decay(&self, now: DateTime<Utc>, errors: &mut Vec<String>) -> Result<DecayReport> {
        let candidates = self.store.decay_candidates()?;
        let mut report = DecayReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        for (index, batch) in candidates.chunks(self.config.batch_size.max(1)).enumerate() {
            let mut outcome = self.decay_batch(batch, now);
            if let Err(ref e) = outcome {
                warn!("Decay batch {} failed, retrying once: {}", index, e);
                outcome = self.decay_batch(batch, now);
            }
            match outcome {
                Ok((applied, archived, unchanged)) => {
                    report.decayed += applied;
                    report.archived += archived;
                    report.unchanged += unchanged;
                    report.batches_committed += 1;
                }
                Err(e) => {
                    warn!("Decay batch {} failed after retry: {}", index, e);
                    errors.push(format!("decay batch {index}: {e}"));
                    report.batches_failed += 1;
                }
            }
        }

        debug!(
            "Decay: {} candidates, {} decayed, {} archived",
            report.candidates, report.decayed, report.archived
        );
        Ok(report)
    }

    fn decay_batch(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<(usize, usize, usize)> {
        let hydrated = self.store.get_memories(ids)?;
        let memories: Vec<Memory> = ids.iter().filter_map(|id| hydrated.get(id).cloned()).collect();
        let (updates, unchanged) = self.decay_updates(&memories, now);
        if updates.is_empty() {
            return Ok((0, 0, unchanged));
        }
        let archived = updates.iter().filter(|u| u.archive).count();
        let applied = self.store.apply_decay_batch(&updates, now)?;
        Ok((applied, archived, unchanged))
    }

    fn resolve_contradictions(&self) -> Result<ContradictionReport> {
        let mut report = ContradictionReport::default();
        for edge in self.store.unresolved_contradictions()? {
            let penalty = edge.weight.unwrap_or(self.contradiction_penalty);
            let outcome = self
                .store
                .resolve_contradiction(edge.from_id, edge.to_id, penalty)?;
            report.processed += 1;
            match outcome {
                PenaltyOutcome::Applied { .. } => report.applied += 1,
                PenaltyOutcome::SkippedPinned => report.skipped_pinned += 1,
                PenaltyOutcome::AlreadyResolved => report.already_resolved += 1,
                PenaltyOutcome::Missing => report.missing += 1,
            }
        }
        Ok(report)
    }

    fn consolidate_journal(&self, now: DateTime<Utc>) -> Result<JournalReport> {
        let cutoff = now - Duration::days(self.config.journal_max_age_days);
        let aged = self.store.journal_before(cutoff)?;
        let mut report = JournalReport::default();
        if aged.is_empty() {
            return Ok(report);
        }

        let mut by_week: BTreeMap<String, Vec<JournalEntry>> = BTreeMap::new();
        for entry in aged {
            by_week.entry(iso_week(entry.timestamp)).or_default().push(entry);
        }

        for (period, entries) in by_week {
            let mut lines: Vec<String> = Vec::new();
            if let Some(existing) = self.store.digest_for(&period)? {
                lines.extend(existing.content.lines().map(str::to_string));
            }
            lines.extend(entries.iter().map(digest_line));
            let timestamp = entries
                .iter()
                .map(|e| e.timestamp)
                .max()
                .unwrap_or(cutoff);
            let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();

            self.store
                .store_digest(&period, &lines.join("\n"), timestamp, &ids)?;
            report.entries_digested += ids.len();
            report.periods.push(period);
        }
        Ok(report)
    }

    async fn synthesize_identity(&self, now: DateTime<Utc>) -> Result<IdentityReport> {
        let existing = self.store.load_identity()?.unwrap_or_default();
        let manual_gates: Vec<Gate> = existing.manual_sections().filter_map(|s| s.gate).collect();

        let mut selected: Vec<(Gate, Vec<Memory>)> = Vec::new();
        for gate in Gate::ALL {
            if manual_gates.contains(&gate) {
                continue;
            }
            let top = self.store.top_memories_by_gate(
                gate,
                self.config.identity_min_confidence,
                self.config.identity_max_per_gate,
            )?;
            if !top.is_empty() {
                selected.push((gate, top));
            }
        }

        let sources: Vec<&Memory> = selected.iter().flat_map(|(_, m)| m.iter()).collect();
        let source_memories = sources.len();
        let fingerprint = fingerprint(&sources);
        if existing.source_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return Ok(IdentityReport {
                regenerated: false,
                sections: existing.sections.len(),
                source_memories,
            });
        }
        if existing.sections.is_empty() && selected.is_empty() {
            return Ok(IdentityReport::default());
        }

        let mut sections = Vec::new();
        for gate in Gate::ALL {
            if let Some(manual) = existing
                .manual_sections()
                .find(|s| s.gate == Some(gate))
            {
                sections.push(manual.clone());
                continue;
            }
            let Some((_, memories)) = selected.iter().find(|(g, _)| *g == gate) else {
                continue;
            };
            let items: Vec<String> = memories.iter().map(|m| m.content.clone()).collect();
            sections.push(IdentitySection {
                title: gate.heading().to_string(),
                body: self.section_body(gate, &items).await,
                gate: Some(gate),
                manual: false,
            });
        }
        sections.extend(
            existing
                .manual_sections()
                .filter(|s| s.gate.is_none())
                .cloned(),
        );

        let document = IdentityDocument {
            sections,
            updated_at: Some(now),
            source_fingerprint: Some(fingerprint),
        };
        self.store.store_identity(&document, now)?;
        debug!(
            "Identity document regenerated: {} sections from {} memories",
            document.sections.len(),
            source_memories
        );
        Ok(IdentityReport {
            regenerated: true,
            sections: document.sections.len(),
            source_memories,
        })
    }

    async fn section_body(&self, gate: Gate, items: &[String]) -> String {
        if let Some(summarizer) = &self.summarizer {
            match summarizer.summarize(gate.heading(), items).await {
                Ok(text) if !text.trim().is_empty() => return text.trim().to_string(),
                Ok(_) => warn!("Summarizer returned nothing for {}", gate),
                Err(e) => warn!("Summarizer failed for {}, using list: {}", gate, e),
            }
        }
        items
            .iter()
            .map(|item| format!("- {item}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn digest_line(entry: &JournalEntry) -> String {
    let gate = entry.gate.map(|g| g.as_str()).unwrap_or(entry.kind.as_str());
    format!(
        "- [{}] ({}) {}",
        entry.timestamp.format("%Y-%m-%d"),
        gate,
        crate::memory::types::preview(&entry.content)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassifierError;
    use crate::memory::records::{Edge, JournalKind, RelationType};
    use crate::memory::types::{DecayClass, Scope};
    use async_trait::async_trait;
    use tempfile::TempDir;

    fn create_engine() -> (ReflectionEngine, Arc<MetadataStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MetadataStore::open(&dir.path().join("memkeep.db")).unwrap());
        let engine = ReflectionEngine::new(
            Arc::clone(&store),
            ReflectionConfig {
                batch_size: 2,
                ..Default::default()
            },
            DecayConfig::default(),
            30.0,
        );
        (engine, store, dir)
    }

    fn memory_at(content: &str, gate: Gate, confidence: f64, created: DateTime<Utc>) -> Memory {
        let mut memory = Memory::new(content, gate, Scope::User, confidence);
        memory.created_at = created;
        memory
    }

    fn confidence_of(store: &MetadataStore, id: Uuid) -> f64 {
        store.get_memory(id).unwrap().unwrap().confidence
    }

    mod decay {
        use super::*;

        #[test]
        fn test_decay_formula() {
            assert!((decayed_confidence(80.0, 168.0, 168.0) - 40.0).abs() < 1e-9);
            assert!((decayed_confidence(80.0, 336.0, 168.0) - 20.0).abs() < 1e-9);
            assert_eq!(decayed_confidence(80.0, 0.0, 168.0), 80.0);
            assert_eq!(decayed_confidence(80.0, -5.0, 168.0), 80.0);
        }

        #[tokio::test]
        async fn test_session_memory_halves_after_half_life() {
            let (engine, store, _dir) = create_engine();
            let t0 = Utc::now() - Duration::days(30);
            let promise = memory_at("I will send the report", Gate::Promissory, 80.0, t0);
            assert_eq!(promise.decay_class, DecayClass::Session);
            store.insert_memory(&promise).unwrap();

            let report = engine.reflect_at(t0 + Duration::days(7)).await.unwrap();
            assert_eq!(report.decay.decayed, 1);
            assert!((confidence_of(&store, promise.id) - 40.0).abs() < 1e-6);
        }

        #[tokio::test]
        async fn test_reflect_twice_is_noop() {
            let (engine, store, _dir) = create_engine();
            let t0 = Utc::now() - Duration::days(30);
            let ids: Vec<Uuid> = (0..5)
                .map(|i| {
                    let m = memory_at(&format!("fact number {i}"), Gate::Epistemic, 70.0, t0);
                    store.insert_memory(&m).unwrap();
                    m.id
                })
                .collect();

            let now = t0 + Duration::days(10);
            engine.reflect_at(now).await.unwrap();
            let after_first: Vec<f64> = ids.iter().map(|id| confidence_of(&store, *id)).collect();

            let second = engine.reflect_at(now).await.unwrap();
            let after_second: Vec<f64> = ids.iter().map(|id| confidence_of(&store, *id)).collect();
            assert_eq!(after_first, after_second);
            assert_eq!(second.decay.decayed, 0);
            assert_eq!(second.decay.unchanged, 5);
            assert!(!second.identity.regenerated);
        }

        #[tokio::test]
        async fn test_split_cycles_match_single_cycle() {
            let (engine, store, _dir) = create_engine();
            let t0 = Utc::now() - Duration::days(30);
            let m = memory_at("fact", Gate::Promissory, 80.0, t0);
            store.insert_memory(&m).unwrap();

            engine.reflect_at(t0 + Duration::days(3)).await.unwrap();
            engine.reflect_at(t0 + Duration::days(7)).await.unwrap();
            assert!((confidence_of(&store, m.id) - 40.0).abs() < 1e-6);
        }

        #[tokio::test]
        async fn test_pinned_and_permanent_are_invariant() {
            let (engine, store, _dir) = create_engine();
            let t0 = Utc::now() - Duration::days(400);
            let mut pinned = memory_at("pinned fact", Gate::Epistemic, 64.0, t0);
            pinned.pinned = true;
            let correction = memory_at("it is X, not Y", Gate::Correction, 90.0, t0);
            store.insert_memory(&pinned).unwrap();
            store.insert_memory(&correction).unwrap();

            for days in [30, 120, 365] {
                engine.reflect_at(t0 + Duration::days(days)).await.unwrap();
                assert_eq!(confidence_of(&store, pinned.id), 64.0);
                assert_eq!(confidence_of(&store, correction.id), 90.0);
            }
        }

        #[tokio::test]
        async fn test_archives_below_floor() {
            let (engine, store, _dir) = create_engine();
            let t0 = Utc::now() - Duration::days(30);
            let mut m = memory_at("short lived", Gate::Epistemic, 40.0, t0);
            m.decay_class = DecayClass::Ephemeral;
            store.insert_memory(&m).unwrap();

            let report = engine.reflect_at(t0 + Duration::hours(72)).await.unwrap();
            assert_eq!(report.decay.archived, 1);
            let stored = store.get_memory(m.id).unwrap().unwrap();
            assert!(stored.archived);
            assert!((stored.confidence - 5.0).abs() < 1e-6);

            // archived memories leave the candidate set
            let again = engine.reflect_at(t0 + Duration::hours(96)).await.unwrap();
            assert_eq!(again.decay.candidates, 0);
        }
    }

    mod contradictions {
        use super::*;

        #[tokio::test]
        async fn test_pending_edges_resolved_once() {
            let (engine, store, _dir) = create_engine();
            let now = Utc::now();
            let old = memory_at("reads db_url", Gate::Epistemic, 70.0, now);
            let mut pinned = memory_at("pinned db_url", Gate::Epistemic, 70.0, now);
            pinned.pinned = true;
            let new = memory_at("use database_url, not db_url", Gate::Correction, 90.0, now);
            for m in [&old, &pinned, &new] {
                store.insert_memory(m).unwrap();
            }
            store
                .insert_edge(&Edge::new(new.id, old.id, RelationType::Contradicts, Some(30.0)))
                .unwrap();
            store
                .insert_edge(&Edge::new(new.id, pinned.id, RelationType::Contradicts, None))
                .unwrap();

            let first = engine.reflect_at(now).await.unwrap();
            assert_eq!(first.contradictions.applied, 1);
            assert_eq!(first.contradictions.skipped_pinned, 1);
            assert_eq!(confidence_of(&store, old.id), 40.0);
            assert_eq!(confidence_of(&store, pinned.id), 70.0);

            let second = engine.reflect_at(now).await.unwrap();
            assert_eq!(second.contradictions.processed, 0);
            assert_eq!(confidence_of(&store, old.id), 40.0);
        }
    }

    mod journal {
        use super::*;

        #[test]
        fn test_iso_week_key() {
            let ts = DateTime::parse_from_rfc3339("2026-02-12T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc);
            assert_eq!(iso_week(ts), "2026-W07");
            // ISO year differs from calendar year at the boundary
            let ts = DateTime::parse_from_rfc3339("2027-01-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc);
            assert_eq!(iso_week(ts), "2026-W53");
        }

        #[tokio::test]
        async fn test_aged_entries_are_digested_and_pruned() {
            let (engine, store, _dir) = create_engine();
            let now = Utc::now();
            let old = now - Duration::days(30);
            store
                .append_journal(JournalKind::Entry, "first", Some(Gate::Epistemic), None, None, old)
                .unwrap();
            store
                .append_journal(JournalKind::Checkpoint, "wrapped up", None, None, None, old)
                .unwrap();
            store
                .append_journal(JournalKind::Entry, "recent", None, None, None, now)
                .unwrap();

            let report = engine.reflect_at(now).await.unwrap();
            assert_eq!(report.journal.entries_digested, 2);
            assert_eq!(report.journal.periods, vec![iso_week(old)]);

            let digest = store.digest_for(&iso_week(old)).unwrap().unwrap();
            assert!(digest.content.contains("(epistemic) first"));
            assert!(digest.content.contains("(checkpoint) wrapped up"));
            assert!(store.journal_before(now - Duration::days(14)).unwrap().is_empty());

            let remaining = store.journal_since(now - Duration::days(1)).unwrap();
            assert_eq!(remaining.len(), 1);

            let again = engine.reflect_at(now).await.unwrap();
            assert_eq!(again.journal.entries_digested, 0);
        }
    }

    mod identity {
        use super::*;

        struct EchoSummarizer;

        #[async_trait]
        impl Summarizer for EchoSummarizer {
            async fn summarize(
                &self,
                heading: &str,
                items: &[String],
            ) -> std::result::Result<String, ClassifierError> {
                Ok(format!("{heading}: {}", items.join("; ")))
            }
        }

        #[tokio::test]
        async fn test_identity_groups_high_confidence_by_gate() {
            let (engine, store, _dir) = create_engine();
            let now = Utc::now();
            store
                .insert_memory(&memory_at("prefers dark mode", Gate::Behavioral, 85.0, now))
                .unwrap();
            store
                .insert_memory(&memory_at("Alice owns billing", Gate::Relational, 75.0, now))
                .unwrap();
            store
                .insert_memory(&memory_at("maybe likes tea", Gate::Behavioral, 40.0, now))
                .unwrap();

            let report = engine.reflect_at(now).await.unwrap();
            assert!(report.identity.regenerated);
            assert_eq!(report.identity.source_memories, 2);

            let doc = store.load_identity().unwrap().unwrap();
            assert_eq!(doc.sections.len(), 2);
            assert_eq!(doc.sections[0].gate, Some(Gate::Behavioral));
            assert_eq!(doc.sections[0].body, "- prefers dark mode");
            assert!(!doc.render().contains("tea"));
        }

        #[tokio::test]
        async fn test_manual_sections_survive_resynthesis() {
            let (engine, store, _dir) = create_engine();
            let now = Utc::now();
            store
                .insert_memory(&memory_at("prefers dark mode", Gate::Behavioral, 85.0, now))
                .unwrap();
            store
                .insert_memory(&memory_at("Alice owns billing", Gate::Relational, 75.0, now))
                .unwrap();
            let manual = IdentityDocument {
                sections: vec![
                    IdentitySection {
                        title: "How I work".into(),
                        body: "Mornings only".into(),
                        gate: Some(Gate::Behavioral),
                        manual: true,
                    },
                    IdentitySection {
                        title: "Notes".into(),
                        body: "Free-form".into(),
                        gate: None,
                        manual: true,
                    },
                ],
                updated_at: None,
                source_fingerprint: None,
            };
            store.store_identity(&manual, now).unwrap();

            engine.reflect_at(now).await.unwrap();
            let doc = store.load_identity().unwrap().unwrap();
            let titles: Vec<&str> = doc.sections.iter().map(|s| s.title.as_str()).collect();
            assert_eq!(titles, vec!["How I work", "People & relationships", "Notes"]);
        }

        #[tokio::test]
        async fn test_summarizer_shapes_section_body() {
            let (engine, store, _dir) = create_engine();
            let engine = engine.with_summarizer(Arc::new(EchoSummarizer));
            let now = Utc::now();
            store
                .insert_memory(&memory_at("prefers dark mode", Gate::Behavioral, 85.0, now))
                .unwrap();

            engine.reflect_at(now).await.unwrap();
            let doc = store.load_identity().unwrap().unwrap();
            assert_eq!(doc.sections[0].body, "Preferences & habits: prefers dark mode");
        }
    }

    #[tokio::test]
    async fn test_overlapping_cycles_rejected() {
        let (engine, store, _dir) = create_engine();
        let guard = engine.cycle_lock.try_lock().unwrap();
        assert!(engine.is_running());
        let err = engine.reflect().await.unwrap_err();
        assert!(matches!(err, MemkeepError::ReflectionInProgress));
        drop(guard);

        engine.reflect().await.unwrap();
        assert!(store.last_reflection_report().unwrap().is_some());
    }
}
