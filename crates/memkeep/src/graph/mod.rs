//! Relation graph between memories
//!
//! Edges live in the metadata store's flat edge table keyed by
//! `(from_id, to_id, relation)`; memories never hold references to each
//! other, so cycles are harmless. This module decides which edges a new
//! memory gets and serves breadth-first traversal.

pub mod opposition;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GraphConfig;
use crate::error::{MemkeepError, Result};
use crate::memory::records::{Direction, Edge, Neighbor, RelationType};
use crate::memory::types::{Gate, Memory};
use crate::storage::lexical::{LexicalIndex, words};
use crate::storage::sqlite::{MetadataStore, PenaltyOutcome};
use crate::storage::vector::{VectorHit, VectorIndex};

/// Lexical candidates examined per rejected term
const TERM_CANDIDATES: usize = 20;
/// Recent promissory memories examined for FOLLOWS
const FOLLOWS_CANDIDATES: usize = 50;

/// Penalty applied (or skipped) for one new CONTRADICTS edge
#[derive(Debug, Clone, Serialize)]
pub struct ContradictionResult {
    pub target: Uuid,
    pub outcome: PenaltyOutcome,
}

/// Edges created for a newly written memory
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkReport {
    pub edges: Vec<Edge>,
    pub contradictions: Vec<ContradictionResult>,
    /// Existing memory that is nearly identical to the new one
    pub possible_duplicate: Option<(Uuid, f32)>,
}

pub struct GraphManager {
    store: Arc<MetadataStore>,
    vectors: Arc<dyn VectorIndex>,
    lexical: Arc<LexicalIndex>,
    config: GraphConfig,
}

impl GraphManager {
    pub fn new(
        store: Arc<MetadataStore>,
        vectors: Arc<dyn VectorIndex>,
        lexical: Arc<LexicalIndex>,
        config: GraphConfig,
    ) -> Self {
        Self {
            store,
            vectors,
            lexical,
            config,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Create RELATED_TO, CONTRADICTS and FOLLOWS edges for a new memory.
    ///
    /// CONTRADICTS penalties are applied immediately through the store's
    /// idempotent resolution, so a later reflection pass never repeats them.
    pub async fn link_new_memory(&self, memory: &Memory, embedding: &[f32]) -> Result<LinkReport> {
        let mut report = LinkReport::default();

        let hits: Vec<VectorHit> = self
            .vectors
            .search(embedding, self.config.related_candidates + 1)
            .await?
            .into_iter()
            .filter(|h| h.id != memory.id)
            .collect();
        let hit_ids: Vec<Uuid> = hits.iter().map(|h| h.id).collect();
        let neighbors = self.store.get_memories(&hit_ids)?;
        let hits: Vec<VectorHit> = hits
            .into_iter()
            .filter(|h| neighbors.contains_key(&h.id))
            .collect();

        if let Some(top) = hits.first() {
            if top.similarity >= self.config.duplicate_threshold {
                report.possible_duplicate = Some((top.id, top.similarity));
            }
        }

        for hit in hits.iter().filter(|h| h.similarity >= self.config.related_threshold) {
            let edge = Edge::new(
                memory.id,
                hit.id,
                RelationType::RelatedTo,
                Some(f64::from(hit.similarity)),
            );
            if self.store.insert_edge(&edge)? {
                report.edges.push(edge);
            }
        }

        let labeled = self.store.memories_sharing_labels(
            memory.person.as_deref(),
            memory.project.as_deref(),
            memory.id,
            self.config.label_link_limit,
        )?;
        for other in &labeled {
            let edge = Edge::new(memory.id, other.id, RelationType::RelatedTo, None);
            if self.store.insert_edge(&edge)? {
                report.edges.push(edge);
            }
        }

        for target in self.contradiction_targets(memory, &hits, &neighbors)? {
            let edge = Edge::new(
                memory.id,
                target,
                RelationType::Contradicts,
                Some(self.config.contradiction_penalty),
            );
            if self.store.insert_edge(&edge)? {
                let outcome = self.store.resolve_contradiction(
                    memory.id,
                    target,
                    self.config.contradiction_penalty,
                )?;
                info!(
                    "Memory {} contradicts {} ({:?})",
                    memory.id, target, outcome
                );
                report.edges.push(edge);
                report
                    .contradictions
                    .push(ContradictionResult { target, outcome });
            }
        }

        if let Some(prior) = self.follows_target(memory)? {
            let edge = Edge::new(memory.id, prior, RelationType::Follows, None);
            if self.store.insert_edge(&edge)? {
                debug!("Memory {} follows {}", memory.id, prior);
                report.edges.push(edge);
            }
        }

        Ok(report)
    }

    /// Older memories a new memory supersedes.
    fn contradiction_targets(
        &self,
        memory: &Memory,
        hits: &[VectorHit],
        neighbors: &HashMap<Uuid, Memory>,
    ) -> Result<Vec<Uuid>> {
        let mut targets: Vec<Uuid> = Vec::new();
        let is_older = |other: &Memory| other.id != memory.id && other.created_at <= memory.created_at;

        if memory.gate == Gate::Correction {
            for term in opposition::rejected_terms(&memory.content) {
                let candidates = self.lexical.search(&term, TERM_CANDIDATES)?;
                let ids: Vec<Uuid> = candidates.iter().map(|c| c.id).collect();
                let found = self.store.get_memories(&ids)?;
                for candidate in candidates {
                    let Some(other) = found.get(&candidate.id) else {
                        continue;
                    };
                    if !is_older(other) || other.archived || targets.contains(&other.id) {
                        continue;
                    }
                    // The older memory must state the term, not reject it too.
                    if words(&other.content).contains(&term)
                        && !opposition::rejected_terms(&other.content).contains(&term)
                    {
                        targets.push(other.id);
                    }
                }
            }

            if targets.is_empty() {
                let fallback = hits.iter().find(|h| {
                    h.similarity >= self.config.correction_threshold
                        && neighbors.get(&h.id).is_some_and(|m| is_older(m) && !m.archived)
                });
                if let Some(hit) = fallback {
                    targets.push(hit.id);
                }
            }
        }

        for hit in hits
            .iter()
            .filter(|h| h.similarity >= self.config.opposition_threshold)
        {
            let Some(other) = neighbors.get(&hit.id) else {
                continue;
            };
            if is_older(other)
                && !targets.contains(&other.id)
                && opposition::conflicts(&memory.content, &other.content)
            {
                targets.push(other.id);
            }
        }

        Ok(targets)
    }

    /// Most related recent commitment that the memory continues.
    fn follows_target(&self, memory: &Memory) -> Result<Option<Uuid>> {
        if !opposition::continues_commitment(&memory.content) {
            return Ok(None);
        }
        let since = memory.created_at - Duration::days(self.config.follows_window_days);
        let recent = self
            .store
            .recent_by_gate(Gate::Promissory, since, FOLLOWS_CANDIDATES)?;

        let best = recent
            .iter()
            .filter(|m| m.id != memory.id && m.created_at <= memory.created_at)
            .map(|m| (opposition::shared_terms(&memory.content, &m.content), m))
            .filter(|(shared, _)| *shared > 0)
            .max_by(|(a, ma), (b, mb)| a.cmp(b).then(ma.created_at.cmp(&mb.created_at)));
        Ok(best.map(|(_, m)| m.id))
    }

    /// Memories reachable from `id` within `depth` hops, nearest first.
    pub fn neighbors(&self, id: Uuid, depth: usize) -> Result<Vec<Neighbor>> {
        if self.store.get_memory(id)?.is_none() {
            return Err(MemkeepError::NotFound(format!("memory {id}")));
        }
        let max_depth = depth.clamp(1, self.config.max_depth.max(1));

        let mut visited: HashSet<Uuid> = HashSet::from([id]);
        let mut queue: VecDeque<(Uuid, usize)> = VecDeque::from([(id, 0)]);
        let mut out = Vec::new();

        while let Some((node, level)) = queue.pop_front() {
            if level >= max_depth {
                continue;
            }
            for edge in self.store.edges_touching(node)? {
                let Some(other) = edge.other(node) else {
                    continue;
                };
                if !visited.insert(other) {
                    continue;
                }
                let Some(memory) = self.store.get_memory(other)? else {
                    warn!("Edge {} -> {} points at a missing memory", edge.from_id, edge.to_id);
                    continue;
                };
                let direction = if edge.relation.is_symmetric() {
                    Direction::Both
                } else if edge.from_id == node {
                    Direction::Outgoing
                } else {
                    Direction::Incoming
                };
                out.push(Neighbor {
                    id: other,
                    via: node,
                    relation: edge.relation,
                    direction,
                    depth: level + 1,
                    gate: memory.gate,
                    confidence: memory.confidence,
                    preview: memory.preview(),
                });
                queue.push_back((other, level + 1));
            }
        }

        Ok(out)
    }

    pub fn edges(&self, id: Uuid) -> Result<Vec<Edge>> {
        self.store.edges_touching(id)
    }
}
