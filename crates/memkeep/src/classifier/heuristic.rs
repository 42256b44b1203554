//! Deterministic keyword/pattern classifier
//!
//! Always available and free. Scores linguistic signals per gate; correction
//! language wins over anything it co-occurs with, and content without a
//! dominant signal is routed to epistemic.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use crate::classifier::provider::Classifier;
use crate::classifier::types::{ClassifierError, GateHints, GateVerdict, SensitivityVerdict};
use crate::memory::types::{Gate, Sensitivity};

/// Confidence when no signal dominates
pub const UNDECIDED_CONFIDENCE: f64 = 50.0;
/// Floor of a correction verdict
pub const CORRECTION_CONFIDENCE: f64 = 90.0;
const CORRECTION_CEILING: f64 = 95.0;
const SIGNAL_BASE: f64 = 60.0;
const SIGNAL_CEILING: f64 = 92.0;
const MODEL_CONFIDENCE_FLOOR: f64 = 1.0;
const MODEL_CONFIDENCE_CEILING: f64 = 99.0;

struct Signal {
    name: &'static str,
    gate: Gate,
    regex: Regex,
}

static GATE_SIGNALS: LazyLock<Vec<Signal>> = LazyLock::new(|| {
    let patterns: Vec<(&str, Gate, &str)> = vec![
        // Corrections
        ("negated_instruction", Gate::Correction, r"(?i)\b(don'?t|do not|never|stop)\b"),
        ("actually", Gate::Correction, r"(?i)\bactually\b"),
        (
            "explicit_wrong",
            Gate::Correction,
            r"(?i)\b(that'?s|that is|it'?s|this is) (wrong|incorrect|not right|not true)\b",
        ),
        ("incorrect", Gate::Correction, r"(?i)\b(incorrect|mistaken|wrong)\b"),
        ("replacement", Gate::Correction, r"(?i)\b(instead of|rather than|no longer)\b"),
        ("trailing_not", Gate::Correction, r"(?i),\s*not\s+\S"),
        ("correction_word", Gate::Correction, r"(?i)\b(correction|to clarify)\b"),
        // Preferences and habits
        ("preference", Gate::Behavioral, r"(?i)\b(prefer|prefers|preferred|preference)\b"),
        (
            "affect",
            Gate::Behavioral,
            r"(?i)\b(likes?|loves?|enjoys?|hates?|dislikes?|can'?t stand)\b",
        ),
        (
            "habit",
            Gate::Behavioral,
            r"(?i)\b(always|usually|typically|tends? to|habit|routine|every (day|morning|evening|week))\b",
        ),
        ("favorite", Gate::Behavioral, r"(?i)\bfavou?rite\b"),
        // People, roles and ownership
        (
            "possessive_role",
            Gate::Relational,
            r"(?i)\b(my|our|his|her|their)\s+(manager|boss|colleague|coworker|co-worker|teammate|friend|wife|husband|partner|mother|father|mom|dad|sister|brother|son|daughter|lead|mentor|client|team|cto|ceo)\b",
        ),
        (
            "affiliation",
            Gate::Relational,
            r"(?i)\b(works? (at|for|with)|reports? to|married to|is responsible for|in charge of)\b",
        ),
        ("ownership", Gate::Relational, r"(?i)\b(owns|maintains|manages|leads)\b"),
        ("named_person", Gate::Relational, r"\b[A-Z][a-z]+ is (my|our|the) [a-z]+"),
        // Commitments
        (
            "future_commitment",
            Gate::Promissory,
            r"(?i)\b(will|i'll|we'll|going to|gonna|plans? to|planning to|promised?|commit(ted)? to|intends? to)\b",
        ),
        (
            "deadline",
            Gate::Promissory,
            r"(?i)\b(tomorrow|tonight|next (week|month|sprint|time)|later today|by (monday|tuesday|wednesday|thursday|friday|saturday|sunday|eod|end of))\b",
        ),
        ("follow_up", Gate::Promissory, r"(?i)\b(follow up|remind|to-?do|deadline)\b"),
        // Facts
        (
            "declarative",
            Gate::Epistemic,
            r"(?i)\b(uses|runs on|requires|supports|defaults to|depends on|is located|lives in|is written in|is hosted)\b",
        ),
        (
            "technical_term",
            Gate::Epistemic,
            r"(?i)\b(api|config|database|server|version|port|url|endpoint|schema|library|crate|repository|repo|deploy(ment)?)\b",
        ),
        ("identifier", Gate::Epistemic, r"\b[a-z0-9]+_[a-z0-9_]+\b"),
        ("quantity", Gate::Epistemic, r"\b\d+(\.\d+)?\b"),
    ];

    patterns
        .into_iter()
        .filter_map(|(name, gate, pattern)| match Regex::new(pattern) {
            Ok(regex) => Some(Signal { name, gate, regex }),
            Err(e) => {
                warn!("Failed to compile gate signal '{}': {}", name, e);
                None
            }
        })
        .collect()
});

static SENSITIVE_TOPICS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    let patterns: Vec<(&str, &str)> = vec![
        (
            "health",
            r"(?i)\b(diagnos(is|ed)|medical|medication|therapy|therapist|illness|pregnan(t|cy)|disease|prescription)\b",
        ),
        (
            "finances",
            r"(?i)\b(salary|income|debt|bank account|mortgage|net worth)\b",
        ),
        (
            "personal life",
            r"(?i)\b(divorce|religio(n|us)|sexual orientation|political (party|views)|lawsuit|arrested)\b",
        ),
        ("location", r"(?i)\b(home address|i live (in|at)|lives at)\b"),
    ];
    patterns
        .into_iter()
        .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|r| (name, r)))
        .collect()
});

/// Per-gate signal counts for a piece of content
pub fn score_signals(content: &str, hints: &GateHints) -> BTreeMap<Gate, Vec<&'static str>> {
    let mut scores: BTreeMap<Gate, Vec<&'static str>> = BTreeMap::new();
    for signal in GATE_SIGNALS.iter() {
        if signal.regex.is_match(content) {
            scores.entry(signal.gate).or_default().push(signal.name);
        }
    }
    if let Some(person) = hints.person.as_deref() {
        if !person.trim().is_empty() {
            scores.entry(Gate::Relational).or_default().push("person_hint");
        }
    }
    scores
}

/// Heuristic gate decision
pub fn classify_gate_heuristic(content: &str, hints: &GateHints) -> GateVerdict {
    let scores = score_signals(content, hints);

    if let Some(signals) = scores.get(&Gate::Correction) {
        let confidence =
            (CORRECTION_CONFIDENCE + 2.5 * (signals.len() as f64 - 1.0)).min(CORRECTION_CEILING);
        return GateVerdict {
            gate: Gate::Correction,
            confidence,
            signals: signals.iter().map(|s| s.to_string()).collect(),
        };
    }

    let mut ranked: Vec<(Gate, usize)> = scores.iter().map(|(g, s)| (*g, s.len())).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    let top = ranked.first().copied();
    let runner_up = ranked.get(1).map(|(_, n)| *n).unwrap_or(0);
    let all_signals: Vec<String> = scores
        .values()
        .flat_map(|s| s.iter().map(|n| n.to_string()))
        .collect();

    match top {
        Some((gate, count)) if count > runner_up => {
            let margin = (count - runner_up) as f64;
            let confidence =
                (SIGNAL_BASE + 8.0 * count as f64 + 4.0 * margin).min(SIGNAL_CEILING);
            GateVerdict {
                gate,
                confidence: confidence.clamp(5.0, 95.0),
                signals: all_signals,
            }
        }
        _ => GateVerdict {
            gate: Gate::Epistemic,
            confidence: UNDECIDED_CONFIDENCE,
            signals: all_signals,
        },
    }
}

/// Hold a model verdict to the same routing guarantees as the heuristic.
///
/// Correction phrasing always lands in the correction gate whatever the model
/// answered, and model confidences stay off the degenerate ends of the scale.
pub fn guard_model_verdict(
    mut verdict: GateVerdict,
    content: &str,
    hints: &GateHints,
) -> GateVerdict {
    verdict.confidence = if verdict.confidence.is_nan() {
        UNDECIDED_CONFIDENCE
    } else {
        verdict
            .confidence
            .clamp(MODEL_CONFIDENCE_FLOOR, MODEL_CONFIDENCE_CEILING)
    };

    if verdict.gate != Gate::Correction {
        let heuristic = classify_gate_heuristic(content, hints);
        if heuristic.gate == Gate::Correction {
            verdict.gate = Gate::Correction;
            verdict.confidence = verdict.confidence.max(heuristic.confidence);
            verdict.signals.extend(heuristic.signals);
        }
    }
    if verdict.gate == Gate::Correction {
        verdict.confidence = verdict.confidence.max(CORRECTION_CONFIDENCE);
    }
    verdict
}

/// Keyword escalation to `sensitive`; `None` when no topic matches.
pub fn sensitive_topic(content: &str) -> Option<SensitivityVerdict> {
    SENSITIVE_TOPICS
        .iter()
        .find(|(_, regex)| regex.is_match(content))
        .map(|(topic, _)| {
            SensitivityVerdict::new(
                Sensitivity::Sensitive,
                format!("mentions {topic} (keyword match)"),
            )
        })
}

/// Classifier backed by the signal tables above
#[derive(Debug, Clone, Default)]
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Classifier for HeuristicClassifier {
    async fn classify_gate(
        &self,
        content: &str,
        hints: &GateHints,
    ) -> Result<GateVerdict, ClassifierError> {
        Ok(classify_gate_heuristic(content, hints))
    }

    /// Only escalates on sensitive topics; it cannot vouch for content being safe.
    async fn classify_sensitivity(
        &self,
        content: &str,
    ) -> Result<SensitivityVerdict, ClassifierError> {
        sensitive_topic(content).ok_or_else(|| {
            ClassifierError::Unavailable("heuristic cannot confirm content is safe".to_string())
        })
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}
