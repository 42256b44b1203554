//! Write-time classification
//!
//! Gate routing and the model-backed half of the sensitivity scan. The
//! heuristic backend is always present; a remote OpenAI-compatible backend is
//! used when configured, behind a timeout/fallback chain.

pub mod chain;
pub mod gate;
pub mod heuristic;
pub mod prompts;
pub mod provider;
pub mod remote;
pub mod types;

pub use chain::{Classified, ClassifierChain};
pub use gate::{GateAssignment, assign_gate, rule_matches};
pub use heuristic::HeuristicClassifier;
pub use provider::{Classifier, Summarizer};
pub use remote::RemoteClassifier;
pub use types::{ClassifierError, ExtractedMemory, GateHints, GateVerdict, SensitivityVerdict};
