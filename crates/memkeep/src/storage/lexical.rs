//! Lexical (sparse) index
//!
//! BM25 postings kept in their own SQLite file next to the vector index. The
//! index is derived data: it can be rebuilt from the metadata store at any
//! time by the reconciliation pass.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::error::{MemkeepError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    memory_id TEXT PRIMARY KEY,
    length INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS postings (
    term TEXT NOT NULL,
    memory_id TEXT NOT NULL,
    tf INTEGER NOT NULL,
    PRIMARY KEY (term, memory_id)
);
CREATE INDEX IF NOT EXISTS idx_postings_memory ON postings(memory_id);
"#;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "do", "does", "for", "from",
    "has", "have", "he", "her", "him", "his", "i", "if", "in", "into", "is", "it", "its", "me",
    "my", "no", "not", "of", "on", "or", "our", "she", "so", "than", "that", "the", "their",
    "them", "then", "there", "these", "they", "this", "to", "us", "was", "we", "were", "what",
    "when", "which", "who", "will", "with", "you", "your",
];

/// Split text into lowercase index terms.
///
/// Words are runs of alphanumerics and underscores; snake_case identifiers
/// are kept whole and also contribute their parts. Stopwords and single
/// characters are dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut out = Vec::new();
    for word in lower.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        let word = word.trim_matches('_');
        if word.chars().count() < 2 || STOPWORDS.contains(&word) {
            continue;
        }
        out.push(word.to_string());
        if word.contains('_') {
            for part in word.split('_') {
                if part.chars().count() >= 2 && !STOPWORDS.contains(&part) {
                    out.push(part.to_string());
                }
            }
        }
    }
    out
}

/// Whole-word terms of `text` (no snake_case parts), used for exact matching.
pub fn words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .map(|w| w.trim_matches('_'))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// BM25 tuning
#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// A lexical match
#[derive(Debug, Clone, PartialEq)]
pub struct LexicalHit {
    pub id: Uuid,
    pub score: f64,
}

/// BM25 index over memory content
pub struct LexicalIndex {
    conn: Mutex<Connection>,
    params: Bm25Params,
}

impl LexicalIndex {
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
        let conn = Connection::open(path)
            .map_err(|e| MemkeepError::Storage(format!("Failed to open lexical index: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| MemkeepError::Storage(format!("Failed to apply lexical schema: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
            params: Bm25Params::default(),
        })
    }

    pub fn with_params(mut self, params: Bm25Params) -> Self {
        self.params = params;
        self
    }

    /// Replace the postings of a memory
    pub fn upsert(&self, id: Uuid, content: &str) -> Result<()> {
        let terms = tokenize(content);
        let mut tf: HashMap<&str, i64> = HashMap::new();
        for term in &terms {
            *tf.entry(term.as_str()).or_default() += 1;
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM postings WHERE memory_id = ?1",
            params![id.to_string()],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO documents (memory_id, length) VALUES (?1, ?2)",
            params![id.to_string(), terms.len() as i64],
        )?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO postings (term, memory_id, tf) VALUES (?1, ?2, ?3)")?;
            for (term, count) in &tf {
                stmt.execute(params![term, id.to_string(), count])?;
            }
        }
        tx.commit()
            .map_err(|e| MemkeepError::Storage(format!("Failed to write postings: {e}")))?;
        Ok(())
    }

    /// Drop a memory from the index; returns whether it was present.
    pub fn remove(&self, id: Uuid) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM postings WHERE memory_id = ?1",
            params![id.to_string()],
        )?;
        let removed = tx.execute(
            "DELETE FROM documents WHERE memory_id = ?1",
            params![id.to_string()],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    pub fn contains(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM documents WHERE memory_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Rank documents against the query with Okapi BM25.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<LexicalHit>> {
        let mut seen = HashSet::new();
        let terms: Vec<String> = tokenize(query)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock();
        let (n_docs, avgdl): (i64, Option<f64>) = conn.query_row(
            "SELECT COUNT(*), AVG(length) FROM documents",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if n_docs == 0 {
            return Ok(Vec::new());
        }
        let n = n_docs as f64;
        let avgdl = avgdl.unwrap_or(1.0).max(1.0);
        let Bm25Params { k1, b } = self.params;

        let mut scores: HashMap<String, f64> = HashMap::new();
        let mut df_stmt = conn.prepare("SELECT COUNT(*) FROM postings WHERE term = ?1")?;
        let mut post_stmt = conn.prepare(
            "SELECT p.memory_id, p.tf, d.length FROM postings p \
             JOIN documents d ON d.memory_id = p.memory_id WHERE p.term = ?1",
        )?;
        for term in &terms {
            let df: i64 = df_stmt.query_row(params![term], |row| row.get(0))?;
            if df == 0 {
                continue;
            }
            let df = df as f64;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
            let rows = post_stmt.query_map(params![term], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for row in rows {
                let (id, tf, len) = row?;
                let tf = tf as f64;
                let norm = k1 * (1.0 - b + b * (len as f64) / avgdl);
                *scores.entry(id).or_default() += idf * (tf * (k1 + 1.0)) / (tf + norm);
            }
        }

        let mut hits = Vec::with_capacity(scores.len());
        for (id, score) in scores {
            let id = Uuid::parse_str(&id)
                .map_err(|e| MemkeepError::Storage(format!("Invalid UUID in postings: {e}")))?;
            hits.push(LexicalHit { id, score });
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(limit);
        Ok(hits)
    }
}
