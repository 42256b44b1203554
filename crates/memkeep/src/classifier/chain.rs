//! Timeout/fallback chain over classifier backends
//!
//! Tries the model-backed primary under a bounded timeout and falls back to
//! the heuristic classifier on any failure, reporting the degradation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::classifier::heuristic::{HeuristicClassifier, guard_model_verdict};
use crate::classifier::provider::Classifier;
use crate::classifier::remote::RemoteClassifier;
use crate::classifier::types::{
    ClassifierError, ExtractedMemory, GateHints, GateVerdict, SensitivityVerdict,
};
use crate::config::ClassifierConfig;

const EXTRACTION_TIMEOUT_FACTOR: u32 = 4;

/// A classifier answer and how it was obtained
#[derive(Debug, Clone)]
pub struct Classified<T> {
    pub value: T,
    /// The model-backed stage did not produce this answer
    pub degraded: bool,
    /// Backend that produced the answer
    pub source: &'static str,
}

pub struct ClassifierChain {
    primary: Option<Arc<dyn Classifier>>,
    fallback: HeuristicClassifier,
    timeout: Duration,
}

impl ClassifierChain {
    pub fn new(primary: Option<Arc<dyn Classifier>>, timeout: Duration) -> Self {
        Self {
            primary,
            fallback: HeuristicClassifier::new(),
            timeout,
        }
    }

    /// Heuristic classification only
    pub fn heuristic_only() -> Self {
        Self::new(None, Duration::from_secs(1))
    }

    /// Use the remote classifier when its key is present.
    pub fn from_config(config: &ClassifierConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let primary: Option<Arc<dyn Classifier>> = match RemoteClassifier::new(config) {
            Ok(remote) => Some(Arc::new(remote)),
            Err(e) => {
                warn!("Model-backed classifier disabled, using heuristics: {}", e);
                None
            }
        };
        Self::new(primary, timeout)
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    pub fn primary_name(&self) -> &'static str {
        self.primary
            .as_ref()
            .map(|p| p.name())
            .unwrap_or(self.fallback.name())
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T, ClassifierError>
    where
        F: std::future::Future<Output = Result<T, ClassifierError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ClassifierError::Timeout(self.timeout)),
        }
    }

    pub async fn classify_gate(&self, content: &str, hints: &GateHints) -> Classified<GateVerdict> {
        if let Some(primary) = &self.primary {
            match self.with_timeout(primary.classify_gate(content, hints)).await {
                Ok(verdict) => {
                    let verdict = guard_model_verdict(verdict, content, hints);
                    debug!("{} classified gate as {}", primary.name(), verdict.gate);
                    return Classified {
                        value: verdict,
                        degraded: false,
                        source: primary.name(),
                    };
                }
                Err(e) => warn!("{} gate classification failed, using heuristics: {}", primary.name(), e),
            }
        }

        let degraded = self.primary.is_some();
        let value = crate::classifier::heuristic::classify_gate_heuristic(content, hints);
        Classified {
            value,
            degraded,
            source: self.fallback.name(),
        }
    }

    /// Candidate memories from a transcript. Only the model-backed primary
    /// can do this; there is no heuristic fallback.
    pub async fn extract_memories(
        &self,
        transcript: &str,
    ) -> Result<Vec<ExtractedMemory>, ClassifierError> {
        let Some(primary) = &self.primary else {
            return Err(ClassifierError::Unavailable(
                "no API key configured, cannot extract memories".to_string(),
            ));
        };
        // Extraction reads a whole transcript; allow it a longer budget.
        let budget = self.timeout * EXTRACTION_TIMEOUT_FACTOR;
        match tokio::time::timeout(budget, primary.extract_memories(transcript)).await {
            Ok(result) => result,
            Err(_) => Err(ClassifierError::Timeout(budget)),
        }
    }

    /// Stage 2 review; `None` means nothing could vouch for the content.
    pub async fn classify_sensitivity(&self, content: &str) -> Classified<Option<SensitivityVerdict>> {
        if let Some(primary) = &self.primary {
            match self.with_timeout(primary.classify_sensitivity(content)).await {
                Ok(verdict) => {
                    return Classified {
                        value: Some(verdict),
                        degraded: false,
                        source: primary.name(),
                    };
                }
                Err(e) => warn!(
                    "{} sensitivity classification failed, leaving unclassified: {}",
                    primary.name(),
                    e
                ),
            }
        }

        let value = match self.fallback.classify_sensitivity(content).await {
            Ok(verdict) => Some(verdict),
            Err(ClassifierError::Unavailable(_)) => None,
            Err(e) => {
                warn!("Heuristic sensitivity check failed: {}", e);
                None
            }
        };
        Classified {
            value,
            degraded: true,
            source: self.fallback.name(),
        }
    }
}
