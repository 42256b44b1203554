//! Records stored alongside memories: relation edges, journal entries,
//! routing rules and the identity document.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{Gate, Scope};
use crate::error::MemkeepError;

/// Kind of relation between two memories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationType {
    /// Symmetric; stored once, traversed both ways
    RelatedTo,
    /// Newer memory supersedes the older one
    Contradicts,
    /// Temporal continuation of an earlier commitment
    Follows,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::RelatedTo => "RELATED_TO",
            RelationType::Contradicts => "CONTRADICTS",
            RelationType::Follows => "FOLLOWS",
        }
    }

    pub fn is_symmetric(&self) -> bool {
        matches!(self, RelationType::RelatedTo)
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationType {
    type Err = MemkeepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RELATED_TO" => Ok(RelationType::RelatedTo),
            "CONTRADICTS" => Ok(RelationType::Contradicts),
            "FOLLOWS" => Ok(RelationType::Follows),
            other => Err(MemkeepError::Validation(format!(
                "unknown relation type: {other}"
            ))),
        }
    }
}

/// Edge in the relation arena, keyed by `(from_id, to_id, relation)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from_id: Uuid,
    pub to_id: Uuid,
    pub relation: RelationType,
    pub created_at: DateTime<Utc>,
    pub weight: Option<f64>,
    /// For CONTRADICTS: whether the penalty has been applied
    pub resolved: bool,
}

impl Edge {
    /// Build an edge; symmetric relations are stored in canonical id order.
    pub fn new(from_id: Uuid, to_id: Uuid, relation: RelationType, weight: Option<f64>) -> Self {
        let (from_id, to_id) = if relation.is_symmetric() && to_id < from_id {
            (to_id, from_id)
        } else {
            (from_id, to_id)
        };
        Self {
            from_id,
            to_id,
            relation,
            created_at: Utc::now(),
            weight,
            resolved: !matches!(relation, RelationType::Contradicts),
        }
    }

    /// The endpoint opposite to `id`, if `id` is on this edge
    pub fn other(&self, id: Uuid) -> Option<Uuid> {
        if self.from_id == id {
            Some(self.to_id)
        } else if self.to_id == id {
            Some(self.from_id)
        } else {
            None
        }
    }
}

/// Direction of a traversed edge relative to the starting memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
    /// Symmetric relation
    Both,
}

/// A memory reached by graph traversal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: Uuid,
    /// Memory the edge was followed from
    pub via: Uuid,
    pub relation: RelationType,
    pub direction: Direction,
    pub depth: usize,
    pub gate: Gate,
    pub confidence: f64,
    pub preview: String,
}

/// Journal entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalKind {
    /// Written with every save
    Entry,
    /// Session checkpoint summary
    Checkpoint,
    /// Weekly consolidation of aged entries
    Digest,
}

impl JournalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalKind::Entry => "entry",
            JournalKind::Checkpoint => "checkpoint",
            JournalKind::Digest => "digest",
        }
    }
}

impl FromStr for JournalKind {
    type Err = MemkeepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(JournalKind::Entry),
            "checkpoint" => Ok(JournalKind::Checkpoint),
            "digest" => Ok(JournalKind::Digest),
            other => Err(MemkeepError::Storage(format!("unknown journal kind: {other}"))),
        }
    }
}

/// Session-derived text chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: i64,
    pub kind: JournalKind,
    pub timestamp: DateTime<Utc>,
    pub gate: Option<Gate>,
    pub content: String,
    pub person: Option<String>,
    pub project: Option<String>,
    /// ISO week (`2026-W07`) covered by a digest
    pub period: Option<String>,
}

/// How strongly a rule overrides default routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Enforcement {
    /// Biases the heuristic towards the rule's gate
    #[default]
    Suggest,
    /// Forces routing and reports a warning
    Warn,
    /// Forces routing silently
    Enforce,
}

impl Enforcement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Enforcement::Suggest => "suggest",
            Enforcement::Warn => "warn",
            Enforcement::Enforce => "enforce",
        }
    }

    pub fn forces(&self) -> bool {
        matches!(self, Enforcement::Warn | Enforcement::Enforce)
    }
}

impl FromStr for Enforcement {
    type Err = MemkeepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "suggest" => Ok(Enforcement::Suggest),
            "warn" => Ok(Enforcement::Warn),
            "enforce" => Ok(Enforcement::Enforce),
            other => Err(MemkeepError::Validation(format!(
                "unknown enforcement: {other}"
            ))),
        }
    }
}

/// Routing rule consulted by the gate classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    /// Free-text condition; matches when all of its words occur in the content
    pub condition: String,
    pub scope: Scope,
    pub enforcement: Enforcement,
    /// Gate the rule routes to, if any
    pub gate: Option<Gate>,
    pub created_at: DateTime<Utc>,
    pub last_triggered: Option<DateTime<Utc>>,
}

/// Input for creating a rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRule {
    pub condition: String,
    #[serde(default = "default_rule_scope")]
    pub scope: Scope,
    #[serde(default)]
    pub enforcement: Enforcement,
    #[serde(default)]
    pub gate: Option<Gate>,
}

fn default_rule_scope() -> Scope {
    Scope::Global
}

/// Partial update of a rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulePatch {
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub enforcement: Option<Enforcement>,
    #[serde(default)]
    pub gate: Option<Gate>,
}

/// Single-per-store narrative synthesized from high-confidence memories
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityDocument {
    pub sections: Vec<IdentitySection>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Fingerprint of the memories the generated sections were built from
    #[serde(default)]
    pub source_fingerprint: Option<String>,
}

impl IdentityDocument {
    pub fn manual_sections(&self) -> impl Iterator<Item = &IdentitySection> {
        self.sections.iter().filter(|s| s.manual)
    }

    /// Render as markdown
    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push_str("## ");
            out.push_str(&section.title);
            out.push_str("\n\n");
            out.push_str(section.body.trim_end());
            out.push_str("\n\n");
        }
        out.trim_end().to_string()
    }
}

/// One section of the identity document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySection {
    pub title: String,
    pub body: String,
    /// Gate the section was generated from; `None` for free-form sections
    #[serde(default)]
    pub gate: Option<Gate>,
    /// Edited by the user; preserved across resynthesis
    #[serde(default)]
    pub manual: bool,
}

/// Degradation reported by an otherwise successful operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    ClassificationDegraded,
    IndexingLag,
    PossibleDuplicate,
    RuleWarning,
    SensitiveContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineWarning {
    pub kind: WarningKind,
    pub message: String,
}

impl EngineWarning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_related_edges_are_canonical() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ab = Edge::new(a, b, RelationType::RelatedTo, Some(0.9));
        let ba = Edge::new(b, a, RelationType::RelatedTo, Some(0.9));
        assert_eq!((ab.from_id, ab.to_id), (ba.from_id, ba.to_id));
    }

    #[test]
    fn test_directional_edges_keep_order() {
        let newer = Uuid::new_v4();
        let older = Uuid::new_v4();
        let edge = Edge::new(newer, older, RelationType::Contradicts, None);
        assert_eq!(edge.from_id, newer);
        assert_eq!(edge.to_id, older);
        assert!(!edge.resolved);

        let follows = Edge::new(newer, older, RelationType::Follows, None);
        assert!(follows.resolved);
    }

    #[test]
    fn test_edge_other_endpoint() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let edge = Edge::new(a, b, RelationType::Follows, None);
        assert_eq!(edge.other(a), Some(b));
        assert_eq!(edge.other(b), Some(a));
        assert_eq!(edge.other(Uuid::new_v4()), None);
    }

    #[test]
    fn test_relation_serialization() {
        let json = serde_json::to_string(&RelationType::RelatedTo).unwrap();
        assert_eq!(json, "\"RELATED_TO\"");
        assert_eq!(
            "CONTRADICTS".parse::<RelationType>().unwrap(),
            RelationType::Contradicts
        );
    }

    #[test]
    fn test_enforcement_forces() {
        assert!(!Enforcement::Suggest.forces());
        assert!(Enforcement::Warn.forces());
        assert!(Enforcement::Enforce.forces());
    }

    #[test]
    fn test_identity_render() {
        let doc = IdentityDocument {
            sections: vec![
                IdentitySection {
                    title: "Preferences & habits".into(),
                    body: "- prefers dark mode\n".into(),
                    gate: Some(Gate::Behavioral),
                    manual: false,
                },
                IdentitySection {
                    title: "About me".into(),
                    body: "Backend engineer.".into(),
                    gate: None,
                    manual: true,
                },
            ],
            ..Default::default()
        };
        let rendered = doc.render();
        assert!(rendered.starts_with("## Preferences & habits"));
        assert!(rendered.ends_with("Backend engineer."));
        assert_eq!(doc.manual_sections().count(), 1);
    }
}
