//! SQLite metadata store
//!
//! The record of truth for memories, relation edges, journal entries, rules,
//! the identity document and the forget audit log. Writes go through a single
//! writer connection inside transactions; reads use a separate connection so
//! they never wait behind the write lock (WAL mode).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{MemkeepError, Result};
use crate::memory::records::{
    Edge, IdentityDocument, JournalEntry, JournalKind, RelationType, Rule,
};
use crate::memory::types::{
    DecayClass, Gate, IndexState, Memory, Scope, Sensitivity, clamp_confidence,
};
use crate::storage::filter::MemoryFilter;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    gate TEXT NOT NULL CHECK (gate IN ('behavioral', 'relational', 'epistemic', 'promissory', 'correction')),
    scope TEXT NOT NULL,
    person TEXT,
    project TEXT,
    confidence REAL NOT NULL CHECK (confidence >= 0 AND confidence <= 100),
    decay_class TEXT NOT NULL,
    pinned INTEGER NOT NULL DEFAULT 0,
    sensitivity TEXT NOT NULL DEFAULT 'unclassified',
    sensitivity_reason TEXT,
    created_at INTEGER NOT NULL,
    last_accessed INTEGER,
    access_count INTEGER NOT NULL DEFAULT 0,
    archived INTEGER NOT NULL DEFAULT 0,
    index_state TEXT NOT NULL DEFAULT 'pending',
    decayed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_memories_gate ON memories(gate);
CREATE INDEX IF NOT EXISTS idx_memories_person ON memories(person);
CREATE INDEX IF NOT EXISTS idx_memories_project ON memories(project);
CREATE INDEX IF NOT EXISTS idx_memories_index_state ON memories(index_state);
CREATE INDEX IF NOT EXISTS idx_memories_archived ON memories(archived, confidence);

CREATE TABLE IF NOT EXISTS edges (
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    relation TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    weight REAL,
    resolved INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (from_id, to_id, relation)
);
CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_id);
CREATE INDEX IF NOT EXISTS idx_edges_unresolved ON edges(relation, resolved);

CREATE TABLE IF NOT EXISTS journal (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    gate TEXT,
    content TEXT NOT NULL,
    person TEXT,
    project TEXT,
    period TEXT
);
CREATE INDEX IF NOT EXISTS idx_journal_timestamp ON journal(kind, timestamp);

CREATE TABLE IF NOT EXISTS identity (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    document TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS rules (
    id TEXT PRIMARY KEY,
    condition TEXT NOT NULL,
    scope TEXT NOT NULL,
    enforcement TEXT NOT NULL,
    gate TEXT,
    created_at INTEGER NOT NULL,
    last_triggered INTEGER
);

CREATE TABLE IF NOT EXISTS forgotten (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    gate TEXT NOT NULL,
    reason TEXT NOT NULL,
    forgotten_at INTEGER NOT NULL,
    record TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_index_removals (
    memory_id TEXT PRIMARY KEY,
    queued_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS reflection_runs (
    id TEXT PRIMARY KEY,
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL,
    report TEXT NOT NULL
);
"#;

const MEMORY_COLUMNS: &str = "id, content, gate, scope, person, project, confidence, decay_class, \
     pinned, sensitivity, sensitivity_reason, created_at, last_accessed, access_count, archived, \
     index_state, decayed_at";

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| MemkeepError::Storage(format!("Invalid timestamp: {micros}")))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| MemkeepError::Storage(format!("Invalid UUID {s}: {e}")))
}

/// Raw memory row as stored
struct MemoryRow {
    id: String,
    content: String,
    gate: String,
    scope: String,
    person: Option<String>,
    project: Option<String>,
    confidence: f64,
    decay_class: String,
    pinned: bool,
    sensitivity: String,
    sensitivity_reason: Option<String>,
    created_at: i64,
    last_accessed: Option<i64>,
    access_count: i64,
    archived: bool,
    index_state: String,
    decayed_at: Option<i64>,
}

impl MemoryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            content: row.get(1)?,
            gate: row.get(2)?,
            scope: row.get(3)?,
            person: row.get(4)?,
            project: row.get(5)?,
            confidence: row.get(6)?,
            decay_class: row.get(7)?,
            pinned: row.get(8)?,
            sensitivity: row.get(9)?,
            sensitivity_reason: row.get(10)?,
            created_at: row.get(11)?,
            last_accessed: row.get(12)?,
            access_count: row.get(13)?,
            archived: row.get(14)?,
            index_state: row.get(15)?,
            decayed_at: row.get(16)?,
        })
    }

    fn into_memory(self) -> Result<Memory> {
        Ok(Memory {
            id: parse_uuid(&self.id)?,
            content: self.content,
            gate: self.gate.parse::<Gate>()?,
            scope: self.scope.parse::<Scope>()?,
            person: self.person,
            project: self.project,
            confidence: clamp_confidence(self.confidence),
            decay_class: self.decay_class.parse::<DecayClass>()?,
            pinned: self.pinned,
            sensitivity: self.sensitivity.parse::<Sensitivity>()?,
            sensitivity_reason: self.sensitivity_reason,
            created_at: from_micros(self.created_at)?,
            last_accessed: self.last_accessed.map(from_micros).transpose()?,
            access_count: self.access_count.max(0) as u64,
            archived: self.archived,
            index_state: self.index_state.parse::<IndexState>()?,
            decayed_at: self.decayed_at.map(from_micros).transpose()?,
        })
    }
}

struct EdgeRow {
    from_id: String,
    to_id: String,
    relation: String,
    created_at: i64,
    weight: Option<f64>,
    resolved: bool,
}

impl EdgeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            from_id: row.get(0)?,
            to_id: row.get(1)?,
            relation: row.get(2)?,
            created_at: row.get(3)?,
            weight: row.get(4)?,
            resolved: row.get(5)?,
        })
    }

    fn into_edge(self) -> Result<Edge> {
        Ok(Edge {
            from_id: parse_uuid(&self.from_id)?,
            to_id: parse_uuid(&self.to_id)?,
            relation: self.relation.parse::<RelationType>()?,
            created_at: from_micros(self.created_at)?,
            weight: self.weight,
            resolved: self.resolved,
        })
    }
}

struct JournalRow {
    id: i64,
    kind: String,
    timestamp: i64,
    gate: Option<String>,
    content: String,
    person: Option<String>,
    project: Option<String>,
    period: Option<String>,
}

impl JournalRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            timestamp: row.get(2)?,
            gate: row.get(3)?,
            content: row.get(4)?,
            person: row.get(5)?,
            project: row.get(6)?,
            period: row.get(7)?,
        })
    }

    fn into_entry(self) -> Result<JournalEntry> {
        Ok(JournalEntry {
            id: self.id,
            kind: self.kind.parse::<JournalKind>()?,
            timestamp: from_micros(self.timestamp)?,
            gate: self.gate.as_deref().map(str::parse::<Gate>).transpose()?,
            content: self.content,
            person: self.person,
            project: self.project,
            period: self.period,
        })
    }
}

struct RuleRow {
    id: String,
    condition: String,
    scope: String,
    enforcement: String,
    gate: Option<String>,
    created_at: i64,
    last_triggered: Option<i64>,
}

impl RuleRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            condition: row.get(1)?,
            scope: row.get(2)?,
            enforcement: row.get(3)?,
            gate: row.get(4)?,
            created_at: row.get(5)?,
            last_triggered: row.get(6)?,
        })
    }

    fn into_rule(self) -> Result<Rule> {
        Ok(Rule {
            id: parse_uuid(&self.id)?,
            condition: self.condition,
            scope: self.scope.parse()?,
            enforcement: self.enforcement.parse()?,
            gate: self.gate.as_deref().map(str::parse::<Gate>).transpose()?,
            created_at: from_micros(self.created_at)?,
            last_triggered: self.last_triggered.map(from_micros).transpose()?,
        })
    }
}

/// Result of resolving one CONTRADICTS edge
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PenaltyOutcome {
    /// Penalty applied to the target
    Applied { previous: f64, current: f64 },
    /// Target is pinned; edge resolved without a penalty
    SkippedPinned,
    /// Edge was already resolved
    AlreadyResolved,
    /// Edge or target no longer exists
    Missing,
}

/// Confidence change computed by the decay engine for one memory
#[derive(Debug, Clone, PartialEq)]
pub struct DecayUpdate {
    pub id: Uuid,
    pub confidence: f64,
    pub archive: bool,
    /// `confidence` observed when the update was computed
    pub observed_confidence: f64,
    /// `last_accessed` observed when the update was computed
    pub observed_last_accessed: Option<DateTime<Utc>>,
}

/// Aggregate counts over the store
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_memories: usize,
    pub archived: usize,
    pub pinned: usize,
    pub by_gate: BTreeMap<String, usize>,
    pub by_sensitivity: BTreeMap<String, usize>,
    pub by_index_state: BTreeMap<String, usize>,
    pub edges_by_relation: BTreeMap<String, usize>,
    pub unresolved_contradictions: usize,
    pub journal_entries: usize,
    pub journal_digests: usize,
    pub forgotten: usize,
    pub rules: usize,
    pub average_confidence: f64,
}

/// Durable record of truth
pub struct MetadataStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    path: PathBuf,
}

impl MetadataStore {
    /// Open (or create) the store at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MemkeepError::Storage(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let writer = Connection::open(path)
            .map_err(|e| MemkeepError::Storage(format!("Failed to open metadata store: {e}")))?;
        writer.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;
        writer
            .execute_batch(SCHEMA)
            .map_err(|e| MemkeepError::Storage(format!("Failed to apply schema: {e}")))?;

        let reader = Connection::open(path)
            .map_err(|e| MemkeepError::Storage(format!("Failed to open reader: {e}")))?;
        reader.execute_batch("PRAGMA busy_timeout=5000;")?;

        tracing::debug!("Metadata store opened at {}", path.display());

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ---------------------------------------------------------------------
    // Memories
    // ---------------------------------------------------------------------

    /// Insert a memory together with its journal entry, atomically.
    pub fn insert_memory(&self, memory: &Memory) -> Result<()> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO memories ({MEMORY_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                memory.id.to_string(),
                memory.content,
                memory.gate.as_str(),
                memory.scope.as_str(),
                memory.person,
                memory.project,
                clamp_confidence(memory.confidence),
                memory.decay_class.as_str(),
                memory.pinned,
                memory.sensitivity.as_str(),
                memory.sensitivity_reason,
                to_micros(memory.created_at),
                memory.last_accessed.map(to_micros),
                memory.access_count as i64,
                memory.archived,
                memory.index_state.as_str(),
                memory.decayed_at.map(to_micros),
            ],
        )
        .map_err(|e| MemkeepError::Storage(format!("Failed to insert memory: {e}")))?;
        tx.execute(
            "INSERT INTO journal (kind, timestamp, gate, content, person, project) \
             VALUES ('entry', ?1, ?2, ?3, ?4, ?5)",
            params![
                to_micros(memory.created_at),
                memory.gate.as_str(),
                memory.content,
                memory.person,
                memory.project,
            ],
        )
        .map_err(|e| MemkeepError::Storage(format!("Failed to write journal entry: {e}")))?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_memory(&self, id: Uuid) -> Result<Option<Memory>> {
        let conn = self.reader.lock();
        let row = conn
            .query_row(
                &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
                params![id.to_string()],
                MemoryRow::from_row,
            )
            .optional()
            .map_err(|e| MemkeepError::Storage(format!("Failed to get memory: {e}")))?;
        row.map(MemoryRow::into_memory).transpose()
    }

    /// Fetch a set of memories by id; unknown ids are absent from the map.
    pub fn get_memories(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Memory>> {
        let mut out = HashMap::with_capacity(ids.len());
        if ids.is_empty() {
            return Ok(out);
        }
        let conn = self.reader.lock();
        // SQLite's default variable limit is 999
        for chunk in ids.chunks(500) {
            let sql = format!(
                "SELECT {MEMORY_COLUMNS} FROM memories WHERE id IN ({})",
                vec!["?"; chunk.len()].join(", ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params_from_iter(chunk.iter().map(|id| id.to_string())),
                MemoryRow::from_row,
            )?;
            for row in rows {
                let memory = row?.into_memory()?;
                out.insert(memory.id, memory);
            }
        }
        Ok(out)
    }

    /// List memories matching the filter, newest first.
    pub fn list_memories(
        &self,
        filter: &MemoryFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Memory>> {
        let (clause, mut values) = filter.to_sql_clause().unwrap_or_default();
        let where_sql = if clause.is_empty() {
            String::new()
        } else {
            format!("WHERE {clause}")
        };
        values.push(Value::Integer(limit as i64));
        values.push(Value::Integer(offset as i64));
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories {where_sql} \
             ORDER BY created_at DESC, id ASC LIMIT ? OFFSET ?"
        );
        self.query_memories(&sql, values)
    }

    pub fn count_memories(&self, filter: &MemoryFilter) -> Result<usize> {
        let (clause, values) = filter.to_sql_clause().unwrap_or_default();
        let where_sql = if clause.is_empty() {
            String::new()
        } else {
            format!("WHERE {clause}")
        };
        let conn = self.reader.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM memories {where_sql}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn query_memories(&self, sql: &str, values: Vec<Value>) -> Result<Vec<Memory>> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), MemoryRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_memory()?);
        }
        Ok(out)
    }

    /// Persist the user-editable and classifier-owned fields of a memory.
    ///
    /// Confidence, access bookkeeping and decay state are left untouched so a
    /// concurrent reflection cycle is never overwritten.
    pub fn update_memory(&self, memory: &Memory) -> Result<bool> {
        let conn = self.writer.lock();
        let changed = conn
            .execute(
                "UPDATE memories SET content = ?2, gate = ?3, scope = ?4, person = ?5, \
                 project = ?6, decay_class = ?7, sensitivity = ?8, sensitivity_reason = ?9, \
                 index_state = ?10 WHERE id = ?1",
                params![
                    memory.id.to_string(),
                    memory.content,
                    memory.gate.as_str(),
                    memory.scope.as_str(),
                    memory.person,
                    memory.project,
                    memory.decay_class.as_str(),
                    memory.sensitivity.as_str(),
                    memory.sensitivity_reason,
                    memory.index_state.as_str(),
                ],
            )
            .map_err(|e| MemkeepError::Storage(format!("Failed to update memory: {e}")))?;
        Ok(changed > 0)
    }

    /// Pin or unpin a memory.
    ///
    /// Unpinning restarts the decay clock at `now` so the pinned period is
    /// never charged retroactively.
    pub fn set_pinned(&self, id: Uuid, pinned: bool, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.writer.lock();
        let changed = conn.execute(
            "UPDATE memories SET pinned = ?2, \
             decayed_at = CASE WHEN ?2 THEN decayed_at ELSE ?3 END WHERE id = ?1",
            params![id.to_string(), pinned, to_micros(now)],
        )?;
        Ok(changed > 0)
    }

    pub fn set_confidence(&self, id: Uuid, confidence: f64) -> Result<bool> {
        let conn = self.writer.lock();
        let changed = conn.execute(
            "UPDATE memories SET confidence = ?2 WHERE id = ?1",
            params![id.to_string(), clamp_confidence(confidence)],
        )?;
        Ok(changed > 0)
    }

    pub fn set_sensitivity(
        &self,
        id: Uuid,
        level: Sensitivity,
        reason: Option<&str>,
    ) -> Result<bool> {
        let conn = self.writer.lock();
        let changed = conn.execute(
            "UPDATE memories SET sensitivity = ?2, sensitivity_reason = ?3 WHERE id = ?1",
            params![id.to_string(), level.as_str(), reason],
        )?;
        Ok(changed > 0)
    }

    pub fn set_index_state(&self, id: Uuid, state: IndexState) -> Result<bool> {
        let conn = self.writer.lock();
        let changed = conn.execute(
            "UPDATE memories SET index_state = ?2 WHERE id = ?1",
            params![id.to_string(), state.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Memories whose index state is not `indexed`, oldest first.
    pub fn memories_needing_index(&self, limit: usize) -> Result<Vec<Memory>> {
        self.query_memories(
            &format!(
                "SELECT {MEMORY_COLUMNS} FROM memories WHERE index_state != 'indexed' \
                 ORDER BY created_at ASC LIMIT ?"
            ),
            vec![Value::Integer(limit as i64)],
        )
    }

    /// Memories awaiting sensitivity review, or all memories with `force`.
    pub fn memories_for_classification(&self, force: bool) -> Result<Vec<Memory>> {
        let sql = if force {
            format!("SELECT {MEMORY_COLUMNS} FROM memories ORDER BY created_at ASC")
        } else {
            format!(
                "SELECT {MEMORY_COLUMNS} FROM memories WHERE sensitivity = 'unclassified' \
                 ORDER BY created_at ASC"
            )
        };
        self.query_memories(&sql, Vec::new())
    }

    /// Bump access bookkeeping for every id.
    pub fn record_access(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE memories SET access_count = access_count + 1, last_accessed = ?2 \
                 WHERE id = ?1",
            )?;
            for id in ids {
                stmt.execute(params![id.to_string(), to_micros(now)])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Un-archive a memory, lifting its confidence to at least `confidence`.
    pub fn resurrect(&self, id: Uuid, confidence: f64, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.writer.lock();
        let changed = conn.execute(
            "UPDATE memories SET archived = 0, confidence = MAX(confidence, ?2), decayed_at = ?3 \
             WHERE id = ?1 AND archived = 1",
            params![id.to_string(), clamp_confidence(confidence), to_micros(now)],
        )?;
        Ok(changed > 0)
    }

    /// Delete a memory, keeping an audit copy with the reason.
    ///
    /// Edges touching the memory are removed in the same transaction.
    pub fn delete_memory(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Memory>> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let row = tx
            .query_row(
                &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
                params![id.to_string()],
                MemoryRow::from_row,
            )
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };
        let memory = row.into_memory()?;
        let record = serde_json::to_string(&memory)?;

        tx.execute(
            "INSERT OR REPLACE INTO forgotten (id, content, gate, reason, forgotten_at, record) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                memory.content,
                memory.gate.as_str(),
                reason,
                to_micros(now),
                record,
            ],
        )?;
        tx.execute(
            "DELETE FROM edges WHERE from_id = ?1 OR to_id = ?1",
            params![id.to_string()],
        )?;
        tx.execute("DELETE FROM memories WHERE id = ?1", params![id.to_string()])?;
        tx.commit()
            .map_err(|e| MemkeepError::Storage(format!("Failed to delete memory: {e}")))?;
        Ok(Some(memory))
    }

    /// Reason recorded when a memory was forgotten
    pub fn forget_reason(&self, id: Uuid) -> Result<Option<String>> {
        let conn = self.reader.lock();
        let reason = conn
            .query_row(
                "SELECT reason FROM forgotten WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(reason)
    }

    /// Recent memories sharing a person or project label with the given ones.
    pub fn memories_sharing_labels(
        &self,
        person: Option<&str>,
        project: Option<&str>,
        exclude: Uuid,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        if person.is_none() && project.is_none() {
            return Ok(Vec::new());
        }
        let mut conditions = Vec::new();
        let mut values = vec![Value::Text(exclude.to_string())];
        if let Some(person) = person {
            conditions.push("person = ? COLLATE NOCASE");
            values.push(Value::Text(person.to_string()));
        }
        if let Some(project) = project {
            conditions.push("project = ? COLLATE NOCASE");
            values.push(Value::Text(project.to_string()));
        }
        values.push(Value::Integer(limit as i64));
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE id != ? AND archived = 0 AND ({}) \
             ORDER BY created_at DESC LIMIT ?",
            conditions.join(" OR ")
        );
        self.query_memories(&sql, values)
    }

    /// Non-archived memories of a gate created at or after `since`, newest first.
    pub fn recent_by_gate(
        &self,
        gate: Gate,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        self.query_memories(
            &format!(
                "SELECT {MEMORY_COLUMNS} FROM memories WHERE gate = ? AND archived = 0 \
                 AND created_at >= ? ORDER BY created_at DESC LIMIT ?"
            ),
            vec![
                Value::Text(gate.as_str().to_string()),
                Value::Integer(to_micros(since)),
                Value::Integer(limit as i64),
            ],
        )
    }

    /// Highest-confidence visible memories of a gate, deterministic order.
    ///
    /// Critical memories never feed identity synthesis.
    pub fn top_memories_by_gate(
        &self,
        gate: Gate,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        self.query_memories(
            &format!(
                "SELECT {MEMORY_COLUMNS} FROM memories WHERE gate = ? AND archived = 0 \
                 AND sensitivity != 'critical' AND confidence >= ? \
                 ORDER BY confidence DESC, created_at ASC, id ASC LIMIT ?"
            ),
            vec![
                Value::Text(gate.as_str().to_string()),
                Value::Real(min_confidence),
                Value::Integer(limit as i64),
            ],
        )
    }

    // ---------------------------------------------------------------------
    // Decay
    // ---------------------------------------------------------------------

    /// Snapshot of ids eligible for decay.
    pub fn decay_candidates(&self) -> Result<Vec<Uuid>> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM memories WHERE pinned = 0 AND archived = 0 \
             AND decay_class != 'permanent' ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(parse_uuid(&row?)?);
        }
        Ok(ids)
    }

    /// Commit one batch of decay updates in a single transaction.
    ///
    /// Rows pinned, accessed or re-scored since the update was computed are
    /// skipped; their decay anchor is untouched so the next run catches up.
    /// Returns the number of rows updated.
    pub fn apply_decay_batch(&self, updates: &[DecayUpdate], now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let mut applied = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE memories SET confidence = ?2, decayed_at = ?3, \
                 archived = CASE WHEN ?4 THEN 1 ELSE archived END \
                 WHERE id = ?1 AND pinned = 0 AND IFNULL(last_accessed, -1) = ?5 \
                 AND confidence = ?6",
            )?;
            for update in updates {
                applied += stmt.execute(params![
                    update.id.to_string(),
                    clamp_confidence(update.confidence),
                    to_micros(now),
                    update.archive,
                    update.observed_last_accessed.map(to_micros).unwrap_or(-1),
                    update.observed_confidence,
                ])?;
            }
        }
        tx.commit()
            .map_err(|e| MemkeepError::Storage(format!("Failed to commit decay batch: {e}")))?;
        Ok(applied)
    }

    // ---------------------------------------------------------------------
    // Edges
    // ---------------------------------------------------------------------

    /// Insert an edge; returns false when an identical key already exists.
    pub fn insert_edge(&self, edge: &Edge) -> Result<bool> {
        let conn = self.writer.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO edges (from_id, to_id, relation, created_at, weight, resolved) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    edge.from_id.to_string(),
                    edge.to_id.to_string(),
                    edge.relation.as_str(),
                    to_micros(edge.created_at),
                    edge.weight,
                    edge.resolved,
                ],
            )
            .map_err(|e| MemkeepError::Storage(format!("Failed to insert edge: {e}")))?;
        Ok(inserted > 0)
    }

    /// All edges with `id` on either end.
    pub fn edges_touching(&self, id: Uuid) -> Result<Vec<Edge>> {
        self.query_edges(
            "SELECT from_id, to_id, relation, created_at, weight, resolved FROM edges \
             WHERE from_id = ?1 OR to_id = ?1 ORDER BY created_at ASC, relation ASC",
            vec![Value::Text(id.to_string())],
        )
    }

    pub fn unresolved_contradictions(&self) -> Result<Vec<Edge>> {
        self.query_edges(
            "SELECT from_id, to_id, relation, created_at, weight, resolved FROM edges \
             WHERE relation = 'CONTRADICTS' AND resolved = 0 ORDER BY created_at ASC",
            Vec::new(),
        )
    }

    fn query_edges(&self, sql: &str, values: Vec<Value>) -> Result<Vec<Edge>> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), EdgeRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_edge()?);
        }
        Ok(out)
    }

    /// Apply the penalty of a CONTRADICTS edge exactly once.
    ///
    /// The resolved flag and the target's confidence change commit together,
    /// so re-running never penalizes twice.
    pub fn resolve_contradiction(
        &self,
        from_id: Uuid,
        to_id: Uuid,
        penalty: f64,
    ) -> Result<PenaltyOutcome> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let resolved: Option<bool> = tx
            .query_row(
                "SELECT resolved FROM edges WHERE from_id = ?1 AND to_id = ?2 \
                 AND relation = 'CONTRADICTS'",
                params![from_id.to_string(), to_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match resolved {
            None => return Ok(PenaltyOutcome::Missing),
            Some(true) => return Ok(PenaltyOutcome::AlreadyResolved),
            Some(false) => {}
        }

        let target: Option<(f64, bool)> = tx
            .query_row(
                "SELECT confidence, pinned FROM memories WHERE id = ?1",
                params![to_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let outcome = match target {
            None => PenaltyOutcome::Missing,
            Some((_, true)) => PenaltyOutcome::SkippedPinned,
            Some((previous, false)) => {
                let current = clamp_confidence(previous - penalty);
                tx.execute(
                    "UPDATE memories SET confidence = ?2 WHERE id = ?1",
                    params![to_id.to_string(), current],
                )?;
                PenaltyOutcome::Applied { previous, current }
            }
        };

        tx.execute(
            "UPDATE edges SET resolved = 1 WHERE from_id = ?1 AND to_id = ?2 \
             AND relation = 'CONTRADICTS'",
            params![from_id.to_string(), to_id.to_string()],
        )?;
        tx.commit()
            .map_err(|e| MemkeepError::Storage(format!("Failed to resolve contradiction: {e}")))?;
        Ok(outcome)
    }

    // ---------------------------------------------------------------------
    // Index bookkeeping
    // ---------------------------------------------------------------------

    /// Remember an index removal that failed so reconciliation can retry it.
    pub fn queue_index_removal(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT INTO pending_index_removals (memory_id, queued_at, attempts) VALUES (?1, ?2, 1) \
             ON CONFLICT(memory_id) DO UPDATE SET attempts = attempts + 1",
            params![id.to_string(), to_micros(now)],
        )?;
        Ok(())
    }

    pub fn pending_index_removals(&self, limit: usize) -> Result<Vec<Uuid>> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare(
            "SELECT memory_id FROM pending_index_removals ORDER BY queued_at ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(parse_uuid(&row?)?);
        }
        Ok(ids)
    }

    pub fn clear_index_removal(&self, id: Uuid) -> Result<()> {
        let conn = self.writer.lock();
        conn.execute(
            "DELETE FROM pending_index_removals WHERE memory_id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Journal
    // ---------------------------------------------------------------------

    pub fn append_journal(
        &self,
        kind: JournalKind,
        content: &str,
        gate: Option<Gate>,
        person: Option<&str>,
        project: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT INTO journal (kind, timestamp, gate, content, person, project) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                kind.as_str(),
                to_micros(at),
                gate.map(|g| g.as_str()),
                content,
                person,
                project,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Journal entries (any kind) at or after `since`, oldest first.
    pub fn journal_since(&self, since: DateTime<Utc>) -> Result<Vec<JournalEntry>> {
        self.query_journal(
            "SELECT id, kind, timestamp, gate, content, person, project, period FROM journal \
             WHERE timestamp >= ?1 ORDER BY timestamp ASC, id ASC",
            vec![Value::Integer(to_micros(since))],
        )
    }

    /// Raw (non-digest) entries older than `cutoff`, oldest first.
    pub fn journal_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<JournalEntry>> {
        self.query_journal(
            "SELECT id, kind, timestamp, gate, content, person, project, period FROM journal \
             WHERE kind != 'digest' AND timestamp < ?1 ORDER BY timestamp ASC, id ASC",
            vec![Value::Integer(to_micros(cutoff))],
        )
    }

    pub fn digest_for(&self, period: &str) -> Result<Option<JournalEntry>> {
        let mut entries = self.query_journal(
            "SELECT id, kind, timestamp, gate, content, person, project, period FROM journal \
             WHERE kind = 'digest' AND period = ?1 ORDER BY id ASC",
            vec![Value::Text(period.to_string())],
        )?;
        Ok(if entries.is_empty() {
            None
        } else {
            Some(entries.remove(0))
        })
    }

    fn query_journal(&self, sql: &str, values: Vec<Value>) -> Result<Vec<JournalEntry>> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), JournalRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_entry()?);
        }
        Ok(out)
    }

    /// Write (or replace) the digest of a period and prune the digested entries.
    pub fn store_digest(
        &self,
        period: &str,
        content: &str,
        timestamp: DateTime<Utc>,
        digested: &[i64],
    ) -> Result<()> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM journal WHERE kind = 'digest' AND period = ?1",
            params![period],
        )?;
        tx.execute(
            "INSERT INTO journal (kind, timestamp, content, period) VALUES ('digest', ?1, ?2, ?3)",
            params![to_micros(timestamp), content, period],
        )?;
        {
            let mut stmt = tx.prepare("DELETE FROM journal WHERE id = ?1 AND kind != 'digest'")?;
            for id in digested {
                stmt.execute(params![id])?;
            }
        }
        tx.commit()
            .map_err(|e| MemkeepError::Storage(format!("Failed to store digest: {e}")))?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Identity
    // ---------------------------------------------------------------------

    pub fn load_identity(&self) -> Result<Option<IdentityDocument>> {
        let conn = self.reader.lock();
        let doc: Option<String> = conn
            .query_row("SELECT document FROM identity WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        doc.map(|d| serde_json::from_str(&d).map_err(MemkeepError::from))
            .transpose()
    }

    pub fn store_identity(&self, doc: &IdentityDocument, now: DateTime<Utc>) -> Result<()> {
        let json = serde_json::to_string(doc)?;
        let conn = self.writer.lock();
        conn.execute(
            "INSERT INTO identity (id, document, updated_at) VALUES (1, ?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET document = excluded.document, \
             updated_at = excluded.updated_at",
            params![json, to_micros(now)],
        )?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Rules
    // ---------------------------------------------------------------------

    pub fn list_rules(&self) -> Result<Vec<Rule>> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare(
            "SELECT id, condition, scope, enforcement, gate, created_at, last_triggered \
             FROM rules ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], RuleRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_rule()?);
        }
        Ok(out)
    }

    pub fn get_rule(&self, id: Uuid) -> Result<Option<Rule>> {
        let conn = self.reader.lock();
        let row = conn
            .query_row(
                "SELECT id, condition, scope, enforcement, gate, created_at, last_triggered \
                 FROM rules WHERE id = ?1",
                params![id.to_string()],
                RuleRow::from_row,
            )
            .optional()?;
        row.map(RuleRow::into_rule).transpose()
    }

    /// Insert or replace a rule
    pub fn upsert_rule(&self, rule: &Rule) -> Result<()> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT OR REPLACE INTO rules (id, condition, scope, enforcement, gate, created_at, last_triggered) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rule.id.to_string(),
                rule.condition,
                rule.scope.as_str(),
                rule.enforcement.as_str(),
                rule.gate.map(|g| g.as_str()),
                to_micros(rule.created_at),
                rule.last_triggered.map(to_micros),
            ],
        )?;
        Ok(())
    }

    pub fn delete_rule(&self, id: Uuid) -> Result<bool> {
        let conn = self.writer.lock();
        let changed = conn.execute("DELETE FROM rules WHERE id = ?1", params![id.to_string()])?;
        Ok(changed > 0)
    }

    pub fn mark_rules_triggered(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.writer.lock();
        for id in ids {
            conn.execute(
                "UPDATE rules SET last_triggered = ?2 WHERE id = ?1",
                params![id.to_string(), to_micros(now)],
            )?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Reflection runs and stats
    // ---------------------------------------------------------------------

    pub fn record_reflection_run(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        report: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT INTO reflection_runs (id, started_at, finished_at, report) VALUES (?1, ?2, ?3, ?4)",
            params![
                id.to_string(),
                to_micros(started_at),
                to_micros(finished_at),
                report.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn last_reflection_report(&self) -> Result<Option<serde_json::Value>> {
        let conn = self.reader.lock();
        let report: Option<String> = conn
            .query_row(
                "SELECT report FROM reflection_runs ORDER BY finished_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        report
            .map(|r| serde_json::from_str(&r).map_err(MemkeepError::from))
            .transpose()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.reader.lock();
        let mut stats = StoreStats::default();

        let (total, archived, pinned, avg): (i64, i64, i64, Option<f64>) = conn.query_row(
            "SELECT COUNT(*), IFNULL(SUM(archived), 0), IFNULL(SUM(pinned), 0), AVG(confidence) \
             FROM memories",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        stats.total_memories = total as usize;
        stats.archived = archived as usize;
        stats.pinned = pinned as usize;
        stats.average_confidence = avg.unwrap_or(0.0);

        stats.by_gate = group_counts(&conn, "SELECT gate, COUNT(*) FROM memories GROUP BY gate")?;
        stats.by_sensitivity = group_counts(
            &conn,
            "SELECT sensitivity, COUNT(*) FROM memories GROUP BY sensitivity",
        )?;
        stats.by_index_state = group_counts(
            &conn,
            "SELECT index_state, COUNT(*) FROM memories GROUP BY index_state",
        )?;
        stats.edges_by_relation =
            group_counts(&conn, "SELECT relation, COUNT(*) FROM edges GROUP BY relation")?;

        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };
        stats.unresolved_contradictions =
            count("SELECT COUNT(*) FROM edges WHERE relation = 'CONTRADICTS' AND resolved = 0")?;
        stats.journal_entries = count("SELECT COUNT(*) FROM journal WHERE kind != 'digest'")?;
        stats.journal_digests = count("SELECT COUNT(*) FROM journal WHERE kind = 'digest'")?;
        stats.forgotten = count("SELECT COUNT(*) FROM forgotten")?;
        stats.rules = count("SELECT COUNT(*) FROM rules")?;

        Ok(stats)
    }
}

fn group_counts(conn: &Connection, sql: &str) -> Result<BTreeMap<String, usize>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    let mut out = BTreeMap::new();
    for row in rows {
        let (key, n) = row?;
        out.insert(key, n as usize);
    }
    Ok(out)
}
