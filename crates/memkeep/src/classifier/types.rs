//! Classifier verdicts and errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::types::{Gate, Sensitivity};

/// Labels that help the gate classifier without forcing it
#[derive(Debug, Clone, Default)]
pub struct GateHints {
    pub person: Option<String>,
    pub project: Option<String>,
}

/// Result of gate classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub gate: Gate,
    /// Initial confidence in `[0, 100]`
    pub confidence: f64,
    /// Names of the signals that fired
    #[serde(default)]
    pub signals: Vec<String>,
}

impl GateVerdict {
    pub fn new(gate: Gate, confidence: f64) -> Self {
        Self {
            gate,
            confidence,
            signals: Vec::new(),
        }
    }
}

/// Result of sensitivity classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityVerdict {
    pub level: Sensitivity,
    pub reason: String,
}

impl SensitivityVerdict {
    pub fn new(level: Sensitivity, reason: impl Into<String>) -> Self {
        Self {
            level,
            reason: reason.into(),
        }
    }
}

/// Candidate memory pulled out of a transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedMemory {
    pub content: String,
    /// Gate proposed by the extractor; unknown names are left to routing
    #[serde(default)]
    pub gate: Option<String>,
    #[serde(default)]
    pub person: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
}

impl ExtractedMemory {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            gate: None,
            person: None,
            project: None,
        }
    }

    pub fn with_gate(mut self, gate: impl Into<String>) -> Self {
        self.gate = Some(gate.into());
        self
    }
}

/// Errors specific to classifier backends
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// Backend cannot produce a verdict (no key, no signal)
    #[error("Classifier unavailable: {0}")]
    Unavailable(String),

    #[error("Classifier timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Classifier API error: {0}")]
    Api(String),

    #[error("Failed to parse classifier response: {0}")]
    Parse(String),

    #[error("Classifier configuration error: {0}")]
    Config(String),
}
