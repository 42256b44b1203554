//! Filter types for memory listing and search
//!
//! The same filter narrows SQL listings in the metadata store and the fused
//! candidate set of the hybrid retriever.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::memory::types::{Gate, Memory, Scope, Sensitivity};

/// Filter criteria for memory operations.
///
/// All fields are optional; unset fields are not applied. Multiple filters are
/// combined with AND logic, lists inside a filter with OR logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryFilter {
    #[serde(default)]
    pub gates: Option<Vec<Gate>>,
    #[serde(default)]
    pub scopes: Option<Vec<Scope>>,
    #[serde(default)]
    pub person: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    /// Confidence floor (inclusive)
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub sensitivity: Option<Vec<Sensitivity>>,
    /// Only memories created at or after this time
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Archived memories are hidden unless this is set
    #[serde(default)]
    pub include_archived: bool,
}

impl MemoryFilter {
    /// Create a new empty filter
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gates(mut self, gates: Vec<Gate>) -> Self {
        self.gates = Some(gates);
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<Scope>) -> Self {
        self.scopes = Some(scopes);
        self
    }

    pub fn with_person(mut self, person: impl Into<String>) -> Self {
        self.person = Some(person.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = Some(min_confidence);
        self
    }

    pub fn with_sensitivity(mut self, levels: Vec<Sensitivity>) -> Self {
        self.sensitivity = Some(levels);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn including_archived(mut self) -> Self {
        self.include_archived = true;
        self
    }

    /// Build a SQL WHERE clause with positional parameters.
    /// Returns `None` if no filters are set.
    pub fn to_sql_clause(&self) -> Option<(String, Vec<Value>)> {
        let mut conditions = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        if let Some(ref gates) = self.gates {
            if !gates.is_empty() {
                conditions.push(format!("gate IN ({})", placeholders(gates.len())));
                params.extend(gates.iter().map(|g| Value::Text(g.as_str().to_string())));
            }
        }

        if let Some(ref scopes) = self.scopes {
            if !scopes.is_empty() {
                conditions.push(format!("scope IN ({})", placeholders(scopes.len())));
                params.extend(scopes.iter().map(|s| Value::Text(s.as_str().to_string())));
            }
        }

        if let Some(ref person) = self.person {
            conditions.push("person = ? COLLATE NOCASE".to_string());
            params.push(Value::Text(person.clone()));
        }

        if let Some(ref project) = self.project {
            conditions.push("project = ? COLLATE NOCASE".to_string());
            params.push(Value::Text(project.clone()));
        }

        if let Some(min_confidence) = self.min_confidence {
            conditions.push("confidence >= ?".to_string());
            params.push(Value::Real(min_confidence));
        }

        if let Some(ref levels) = self.sensitivity {
            if !levels.is_empty() {
                conditions.push(format!("sensitivity IN ({})", placeholders(levels.len())));
                params.extend(levels.iter().map(|l| Value::Text(l.as_str().to_string())));
            }
        }

        // created_at is stored as microseconds since epoch
        if let Some(ref since) = self.since {
            conditions.push("created_at >= ?".to_string());
            params.push(Value::Integer(since.timestamp_micros()));
        }

        if !self.include_archived {
            conditions.push("archived = 0".to_string());
        }

        if conditions.is_empty() {
            None
        } else {
            Some((conditions.join(" AND "), params))
        }
    }

    /// Evaluate the filter against a hydrated memory.
    pub fn matches(&self, memory: &Memory) -> bool {
        if !self.include_archived && memory.archived {
            return false;
        }
        if let Some(ref gates) = self.gates {
            if !gates.is_empty() && !gates.contains(&memory.gate) {
                return false;
            }
        }
        if let Some(ref scopes) = self.scopes {
            if !scopes.is_empty() && !scopes.contains(&memory.scope) {
                return false;
            }
        }
        if let Some(ref person) = self.person {
            if !label_eq(memory.person.as_deref(), person) {
                return false;
            }
        }
        if let Some(ref project) = self.project {
            if !label_eq(memory.project.as_deref(), project) {
                return false;
            }
        }
        if let Some(min_confidence) = self.min_confidence {
            if memory.confidence < min_confidence {
                return false;
            }
        }
        if let Some(ref levels) = self.sensitivity {
            if !levels.is_empty() && !levels.contains(&memory.sensitivity) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if memory.created_at < since {
                return false;
            }
        }
        true
    }

    /// Check if this filter is empty (default visibility only)
    pub fn is_empty(&self) -> bool {
        self.gates.is_none()
            && self.scopes.is_none()
            && self.person.is_none()
            && self.project.is_none()
            && self.min_confidence.is_none()
            && self.sensitivity.is_none()
            && self.since.is_none()
            && !self.include_archived
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn label_eq(value: Option<&str>, expected: &str) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case(expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(gate: Gate, scope: Scope, confidence: f64) -> Memory {
        Memory::new("content", gate, scope, confidence)
    }

    #[test]
    fn test_empty_filter() {
        let filter = MemoryFilter::new();
        assert!(filter.is_empty());
        let (clause, params) = filter.to_sql_clause().unwrap();
        assert_eq!(clause, "archived = 0");
        assert!(params.is_empty());
    }

    #[test]
    fn test_include_archived_drops_visibility_clause() {
        let filter = MemoryFilter::new().including_archived();
        assert!(filter.to_sql_clause().is_none());
        assert!(!filter.is_empty());
    }

    #[test]
    fn test_combined_clause() {
        let filter = MemoryFilter::new()
            .with_gates(vec![Gate::Behavioral, Gate::Correction])
            .with_project("memkeep")
            .with_min_confidence(50.0);
        let (clause, params) = filter.to_sql_clause().unwrap();
        assert_eq!(
            clause,
            "gate IN (?, ?) AND project = ? COLLATE NOCASE AND confidence >= ? AND archived = 0"
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_matches_gate_and_confidence() {
        let filter = MemoryFilter::new()
            .with_gates(vec![Gate::Behavioral])
            .with_min_confidence(60.0);
        assert!(filter.matches(&memory(Gate::Behavioral, Scope::User, 70.0)));
        assert!(!filter.matches(&memory(Gate::Behavioral, Scope::User, 50.0)));
        assert!(!filter.matches(&memory(Gate::Epistemic, Scope::User, 70.0)));
    }

    #[test]
    fn test_matches_labels_case_insensitive() {
        let mut m = memory(Gate::Relational, Scope::Project, 70.0);
        m.person = Some("Sarah".into());
        m.project = Some("Atlas".into());
        assert!(MemoryFilter::new().with_person("sarah").matches(&m));
        assert!(MemoryFilter::new().with_project("ATLAS").matches(&m));
        assert!(!MemoryFilter::new().with_person("bob").matches(&m));
    }

    #[test]
    fn test_archived_hidden_by_default() {
        let mut m = memory(Gate::Epistemic, Scope::User, 5.0);
        m.archived = true;
        assert!(!MemoryFilter::new().matches(&m));
        assert!(MemoryFilter::new().including_archived().matches(&m));
    }

    #[test]
    fn test_filter_deserializes_from_json() {
        let filter: MemoryFilter =
            serde_json::from_str(r#"{"gates":["correction"],"scopes":["global"]}"#).unwrap();
        assert_eq!(filter.gates, Some(vec![Gate::Correction]));
        assert_eq!(filter.scopes, Some(vec![Scope::Global]));
        assert!(!filter.include_archived);
    }
}
