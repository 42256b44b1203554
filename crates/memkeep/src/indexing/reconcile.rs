//! Reconciliation of the derived indices against the metadata store
//!
//! Picks up records whose indexing lagged (state `pending` or `failed`) and
//! index removals that failed during forget, and retries them.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::graph::GraphManager;
use crate::indexing::{IndexingPipeline, WriteLocks};
use crate::memory::types::IndexState;
use crate::storage::sqlite::MetadataStore;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub reindexed: usize,
    pub failed: usize,
    /// Edges created while linking newly indexed records
    pub linked: usize,
    pub removals_retried: usize,
    pub removals_failed: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.removals_failed == 0
    }
}

pub struct Reconciler {
    store: Arc<MetadataStore>,
    pipeline: Arc<IndexingPipeline>,
    graph: Arc<GraphManager>,
    locks: Arc<WriteLocks>,
}

impl Reconciler {
    pub fn new(
        store: Arc<MetadataStore>,
        pipeline: Arc<IndexingPipeline>,
        graph: Arc<GraphManager>,
        locks: Arc<WriteLocks>,
    ) -> Self {
        Self {
            store,
            pipeline,
            graph,
            locks,
        }
    }

    /// Retry up to `limit` lagging index writes and pending removals.
    pub async fn run(&self, limit: usize) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for lagging in self.store.memories_needing_index(limit)? {
            let _guard = self.locks.acquire(lagging.id).await;
            // A write that held the lock may have reindexed or removed it.
            let Some(memory) = self.store.get_memory(lagging.id)? else {
                continue;
            };
            if memory.index_state == IndexState::Indexed {
                debug!("Memory {} was reindexed by a concurrent write", memory.id);
                continue;
            }
            match self.pipeline.index(&memory).await {
                Ok(embedding) => {
                    self.store.set_index_state(memory.id, IndexState::Indexed)?;
                    report.reindexed += 1;
                    // Records that lagged on save never got their edges.
                    match self.graph.link_new_memory(&memory, &embedding).await {
                        Ok(links) => report.linked += links.edges.len(),
                        Err(e) => warn!("Linking memory {} failed: {}", memory.id, e),
                    }
                }
                Err(e) => {
                    debug!("Reindex of {} still failing: {}", memory.id, e);
                    self.store.set_index_state(memory.id, IndexState::Failed)?;
                    report.failed += 1;
                }
            }
        }

        for id in self.store.pending_index_removals(limit)? {
            report.removals_retried += 1;
            match self.pipeline.remove(id).await {
                Ok(()) => self.store.clear_index_removal(id)?,
                Err(e) => {
                    warn!("Index removal of {} still failing: {}", id, e);
                    self.store.queue_index_removal(id, Utc::now())?;
                    report.removals_failed += 1;
                }
            }
        }

        if report.reindexed > 0 || report.removals_retried > 0 {
            info!(
                "Reconciliation: {} reindexed, {} failed, {} removals retried",
                report.reindexed, report.failed, report.removals_retried
            );
        }
        Ok(report)
    }
}
