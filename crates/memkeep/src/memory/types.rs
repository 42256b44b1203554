//! Memory types for memkeep
//!
//! Defines the memory record and the closed vocabularies it is classified
//! with: gate, scope, decay class, sensitivity and index state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MemkeepError;

/// Characters kept in content previews
pub const PREVIEW_CHARS: usize = 200;

/// Upper bound on stored content
pub const MAX_CONTENT_CHARS: usize = 10_000;

/// Clamp a confidence value into `[0, 100]`; NaN becomes 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Truncate text to [`PREVIEW_CHARS`] characters on a char boundary.
pub fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(PREVIEW_CHARS).collect();
    out.push_str("...");
    out
}

/// Semantic category every memory is routed through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gate {
    /// Preferences and habits
    Behavioral,
    /// People, roles and ownership
    Relational,
    /// Facts and technical knowledge
    Epistemic,
    /// Commitments about the future
    Promissory,
    /// Explicit corrections of earlier knowledge
    Correction,
}

impl Gate {
    pub const ALL: [Gate; 5] = [
        Gate::Behavioral,
        Gate::Relational,
        Gate::Epistemic,
        Gate::Promissory,
        Gate::Correction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Gate::Behavioral => "behavioral",
            Gate::Relational => "relational",
            Gate::Epistemic => "epistemic",
            Gate::Promissory => "promissory",
            Gate::Correction => "correction",
        }
    }

    /// Decay profile used when the caller does not pick one
    pub fn default_decay_class(&self) -> DecayClass {
        match self {
            Gate::Promissory => DecayClass::Session,
            Gate::Correction => DecayClass::Permanent,
            Gate::Behavioral | Gate::Relational | Gate::Epistemic => DecayClass::Durable,
        }
    }

    /// Section heading in the identity document
    pub fn heading(&self) -> &'static str {
        match self {
            Gate::Behavioral => "Preferences & habits",
            Gate::Relational => "People & relationships",
            Gate::Epistemic => "Knowledge",
            Gate::Promissory => "Commitments",
            Gate::Correction => "Corrections",
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gate {
    type Err = MemkeepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "behavioral" | "behavioural" => Ok(Gate::Behavioral),
            "relational" => Ok(Gate::Relational),
            "epistemic" => Ok(Gate::Epistemic),
            "promissory" => Ok(Gate::Promissory),
            "correction" => Ok(Gate::Correction),
            other => Err(MemkeepError::Validation(format!("unknown gate: {other}"))),
        }
    }
}

/// Visibility scope of a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    User,
    Project,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Project => "project",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = MemkeepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Scope::User),
            "project" => Ok(Scope::Project),
            "global" => Ok(Scope::Global),
            other => Err(MemkeepError::Validation(format!("unknown scope: {other}"))),
        }
    }
}

/// Named half-life profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayClass {
    Ephemeral,
    Session,
    Durable,
    Permanent,
}

impl DecayClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecayClass::Ephemeral => "ephemeral",
            DecayClass::Session => "session",
            DecayClass::Durable => "durable",
            DecayClass::Permanent => "permanent",
        }
    }

    /// Half-life in hours, `None` for permanent memories.
    pub fn half_life_hours(&self, config: &crate::config::DecayConfig) -> Option<f64> {
        match self {
            DecayClass::Ephemeral => Some(config.ephemeral_hours),
            DecayClass::Session => Some(config.session_days * 24.0),
            DecayClass::Durable => Some(config.durable_days * 24.0),
            DecayClass::Permanent => None,
        }
    }
}

impl fmt::Display for DecayClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecayClass {
    type Err = MemkeepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ephemeral" => Ok(DecayClass::Ephemeral),
            "session" => Ok(DecayClass::Session),
            "durable" => Ok(DecayClass::Durable),
            "permanent" => Ok(DecayClass::Permanent),
            other => Err(MemkeepError::Validation(format!(
                "unknown decay class: {other}"
            ))),
        }
    }
}

/// Privacy risk of a memory's content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Safe,
    Sensitive,
    Critical,
    /// The model stage did not run; awaiting batch or manual review
    Unclassified,
}

impl Sensitivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sensitivity::Safe => "safe",
            Sensitivity::Sensitive => "sensitive",
            Sensitivity::Critical => "critical",
            Sensitivity::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sensitivity {
    type Err = MemkeepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "safe" => Ok(Sensitivity::Safe),
            "sensitive" => Ok(Sensitivity::Sensitive),
            "critical" => Ok(Sensitivity::Critical),
            "unclassified" => Ok(Sensitivity::Unclassified),
            other => Err(MemkeepError::Validation(format!(
                "unknown sensitivity level: {other}"
            ))),
        }
    }
}

/// Whether the retrieval indices reflect the current content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    /// Committed, not yet indexed
    Pending,
    /// Present in the dense and lexical indices
    Indexed,
    /// Last indexing attempt failed; picked up by reconciliation
    Failed,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Pending => "pending",
            IndexState::Indexed => "indexed",
            IndexState::Failed => "failed",
        }
    }
}

impl FromStr for IndexState {
    type Err = MemkeepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IndexState::Pending),
            "indexed" => Ok(IndexState::Indexed),
            "failed" => Ok(IndexState::Failed),
            other => Err(MemkeepError::Storage(format!("unknown index state: {other}"))),
        }
    }
}

/// A single memory record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,
    pub content: String,
    pub gate: Gate,
    pub scope: Scope,
    pub person: Option<String>,
    pub project: Option<String>,
    /// Current (decayed) confidence in `[0, 100]`
    pub confidence: f64,
    pub decay_class: DecayClass,
    /// Pinned memories never decay
    pub pinned: bool,
    pub sensitivity: Sensitivity,
    pub sensitivity_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    /// `None` until the first access
    pub last_accessed: Option<DateTime<Utc>>,
    pub access_count: u64,
    /// Hidden from default retrieval after decaying below the floor
    pub archived: bool,
    pub index_state: IndexState,
    /// Timestamp up to which decay has been applied
    pub decayed_at: Option<DateTime<Utc>>,
}

impl Memory {
    /// Create a new, unindexed memory
    pub fn new(content: impl Into<String>, gate: Gate, scope: Scope, confidence: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            gate,
            scope,
            person: None,
            project: None,
            confidence: clamp_confidence(confidence),
            decay_class: gate.default_decay_class(),
            pinned: false,
            sensitivity: Sensitivity::Unclassified,
            sensitivity_reason: None,
            created_at: Utc::now(),
            last_accessed: None,
            access_count: 0,
            archived: false,
            index_state: IndexState::Pending,
            decayed_at: None,
        }
    }

    /// Update the confidence, clamped to `[0, 100]`
    pub fn set_confidence(&mut self, confidence: f64) {
        self.confidence = clamp_confidence(confidence);
    }

    /// Mark this memory as accessed
    pub fn mark_accessed(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed = Some(now);
    }

    /// Last access, or creation when never accessed
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.last_accessed.unwrap_or(self.created_at)
    }

    /// Start of the window over which decay has not yet been applied
    pub fn decay_anchor(&self) -> DateTime<Utc> {
        let touched = self.last_touched();
        match self.decayed_at {
            Some(decayed) if decayed > touched => decayed,
            _ => touched,
        }
    }

    pub fn preview(&self) -> String {
        preview(&self.content)
    }
}

/// Input of the save operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveRequest {
    pub content: String,
    #[serde(default)]
    pub gate: Option<Gate>,
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub person: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub decay_class: Option<DecayClass>,
    #[serde(default)]
    pub pinned: bool,
}

impl SaveRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
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

    pub fn with_decay_class(mut self, decay_class: DecayClass) -> Self {
        self.decay_class = Some(decay_class);
        self
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }
}

/// User edit of an existing memory; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryPatch {
    #[serde(default)]
    pub content: Option<String>,
    /// Explicit reclassification
    #[serde(default)]
    pub gate: Option<Gate>,
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub person: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub decay_class: Option<DecayClass>,
}

impl MemoryPatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.gate.is_none()
            && self.scope.is_none()
            && self.person.is_none()
            && self.project.is_none()
            && self.decay_class.is_none()
    }
}

/// Normalize an optional label: trimmed, empty becomes `None`.
pub fn normalize_label(label: Option<String>) -> Option<String> {
    label
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_gate_round_trip_through_str() {
        for gate in Gate::ALL {
            assert_eq!(gate.as_str().parse::<Gate>().unwrap(), gate);
        }
        assert!("opinion".parse::<Gate>().is_err());
    }

    #[test]
    fn test_gate_serializes_lowercase() {
        let json = serde_json::to_string(&Gate::Promissory).unwrap();
        assert_eq!(json, "\"promissory\"");
    }

    #[test]
    fn test_default_decay_class_by_gate() {
        assert_eq!(Gate::Promissory.default_decay_class(), DecayClass::Session);
        assert_eq!(Gate::Correction.default_decay_class(), DecayClass::Permanent);
        assert_eq!(Gate::Behavioral.default_decay_class(), DecayClass::Durable);
    }

    #[test]
    fn test_memory_new_defaults() {
        let memory = Memory::new("user prefers tabs", Gate::Behavioral, Scope::User, 72.0);
        assert_eq!(memory.access_count, 0);
        assert!(memory.last_accessed.is_none());
        assert!(!memory.pinned);
        assert!(!memory.archived);
        assert_eq!(memory.sensitivity, Sensitivity::Unclassified);
        assert_eq!(memory.index_state, IndexState::Pending);
        assert_eq!(memory.decay_class, DecayClass::Durable);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let mut memory = Memory::new("x", Gate::Epistemic, Scope::User, 150.0);
        assert_eq!(memory.confidence, 100.0);
        memory.set_confidence(-3.0);
        assert_eq!(memory.confidence, 0.0);
        memory.set_confidence(f64::NAN);
        assert_eq!(memory.confidence, 0.0);
    }

    #[test]
    fn test_decay_anchor_prefers_latest_event() {
        let mut memory = Memory::new("x", Gate::Epistemic, Scope::User, 50.0);
        let created = memory.created_at;
        assert_eq!(memory.decay_anchor(), created);

        let accessed = created + Duration::hours(2);
        memory.mark_accessed(accessed);
        assert_eq!(memory.decay_anchor(), accessed);

        memory.decayed_at = Some(created + Duration::hours(5));
        assert_eq!(memory.decay_anchor(), created + Duration::hours(5));
    }

    #[test]
    fn test_half_lives() {
        let config = crate::config::DecayConfig::default();
        assert_eq!(DecayClass::Ephemeral.half_life_hours(&config), Some(24.0));
        assert_eq!(DecayClass::Session.half_life_hours(&config), Some(168.0));
        assert_eq!(DecayClass::Durable.half_life_hours(&config), Some(2160.0));
        assert_eq!(DecayClass::Permanent.half_life_hours(&config), None);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(300);
        let p = preview(&long);
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
        assert!(p.ends_with("..."));
        assert_eq!(preview("short"), "short");
    }

    #[test]
    fn test_normalize_label() {
        assert_eq!(normalize_label(Some("  alice ".into())), Some("alice".into()));
        assert_eq!(normalize_label(Some("   ".into())), None);
        assert_eq!(normalize_label(None), None);
    }
}
