//! Classifier and summarizer traits
//!
//! Model-backed classification is optional and non-deterministic; the engine
//! only talks to these traits, with the heuristic implementation always
//! available behind them.

use async_trait::async_trait;

use crate::classifier::types::{
    ClassifierError, ExtractedMemory, GateHints, GateVerdict, SensitivityVerdict,
};

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Route content to one of the five gates
    async fn classify_gate(
        &self,
        content: &str,
        hints: &GateHints,
    ) -> Result<GateVerdict, ClassifierError>;

    /// Judge the privacy risk of content that passed the pattern scan
    async fn classify_sensitivity(
        &self,
        content: &str,
    ) -> Result<SensitivityVerdict, ClassifierError>;

    /// Pull candidate memories out of a conversation transcript
    async fn extract_memories(
        &self,
        _transcript: &str,
    ) -> Result<Vec<ExtractedMemory>, ClassifierError> {
        Err(ClassifierError::Unavailable(format!(
            "{} cannot extract memories",
            self.name()
        )))
    }

    /// Whether the backend can currently serve requests
    async fn is_available(&self) -> bool;

    /// Provider name for logging
    fn name(&self) -> &'static str;
}

/// Optional narrative step used by identity synthesis
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Condense the items of one identity section into prose
    async fn summarize(&self, heading: &str, items: &[String]) -> Result<String, ClassifierError>;
}
