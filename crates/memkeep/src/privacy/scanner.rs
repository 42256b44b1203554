//! Two-stage sensitivity scanner
//!
//! Stage 1 is the pattern scan; any hit is `critical` and the model is never
//! consulted. Stage 2 asks the classifier chain. When nothing can vouch for
//! the content it stays `unclassified` for later review, never `safe`.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::classifier::ClassifierChain;
use crate::memory::types::Sensitivity;
use crate::privacy::patterns::{self, PiiKind};

/// Result of scanning one piece of content
#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub sensitivity: Sensitivity,
    pub reason: Option<String>,
    /// Stage 1 pattern kinds that matched
    pub matches: Vec<PiiKind>,
    /// Stage 2 was needed but the model-backed classifier did not answer
    pub degraded: bool,
    pub model_consulted: bool,
}

pub struct SensitivityScanner {
    chain: Arc<ClassifierChain>,
}

impl SensitivityScanner {
    pub fn new(chain: Arc<ClassifierChain>) -> Self {
        Self { chain }
    }

    /// Stage 1 only
    pub fn pattern_scan(content: &str) -> Vec<PiiKind> {
        patterns::scan(content)
    }

    pub async fn scan(&self, content: &str) -> ScanOutcome {
        let matches = patterns::scan(content);
        if !matches.is_empty() {
            let labels: Vec<&str> = matches.iter().map(|k| k.as_str()).collect();
            debug!("Pattern scan matched {:?}", labels);
            return ScanOutcome {
                sensitivity: Sensitivity::Critical,
                reason: Some(format!("matched patterns: {}", labels.join(", "))),
                matches,
                degraded: false,
                model_consulted: false,
            };
        }

        let classified = self.chain.classify_sensitivity(content).await;
        let model_consulted = self.chain.has_primary();
        match classified.value {
            Some(verdict) => ScanOutcome {
                sensitivity: verdict.level,
                reason: Some(verdict.reason),
                matches,
                degraded: classified.degraded,
                model_consulted,
            },
            None => ScanOutcome {
                sensitivity: Sensitivity::Unclassified,
                reason: Some("awaiting review: sensitivity classifier unavailable".to_string()),
                matches,
                degraded: true,
                model_consulted,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> SensitivityScanner {
        SensitivityScanner::new(Arc::new(ClassifierChain::heuristic_only()))
    }

    #[tokio::test]
    async fn test_pattern_hit_is_critical() {
        let outcome = scanner().scan("my card is 4111 1111 1111 1111").await;
        assert_eq!(outcome.sensitivity, Sensitivity::Critical);
        assert_eq!(outcome.matches, vec![PiiKind::CreditCard]);
        assert!(!outcome.model_consulted);
        assert!(!outcome.degraded);
    }

    #[tokio::test]
    async fn test_unreviewed_content_stays_unclassified() {
        let outcome = scanner().scan("user prefers dark mode").await;
        assert_eq!(outcome.sensitivity, Sensitivity::Unclassified);
        assert!(outcome.degraded);
    }

    #[tokio::test]
    async fn test_keyword_escalation() {
        let outcome = scanner().scan("I was diagnosed with asthma").await;
        assert_eq!(outcome.sensitivity, Sensitivity::Sensitive);
    }
}
