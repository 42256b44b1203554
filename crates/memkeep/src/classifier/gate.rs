//! Gate and scope assignment for new memories
//!
//! Precedence: enforce rules, then a caller-supplied gate, then warn rules,
//! then the classifier chain (biased by suggest rules).

use std::collections::HashSet;

use uuid::Uuid;

use crate::classifier::chain::ClassifierChain;
use crate::classifier::types::GateHints;
use crate::memory::records::{Enforcement, EngineWarning, Rule, WarningKind};
use crate::memory::types::{Gate, SaveRequest, Scope, clamp_confidence};
use crate::storage::lexical::tokenize;

/// Confidence of a caller-supplied gate
pub const CALLER_GATE_CONFIDENCE: f64 = 85.0;
/// Confidence of a gate forced by a rule
pub const RULE_GATE_CONFIDENCE: f64 = 90.0;
/// Confidence of a gate adopted from a suggest rule
const SUGGESTED_GATE_CONFIDENCE: f64 = 65.0;
/// Heuristic verdicts at or above this ignore suggest rules
const SUGGESTION_OVERRIDE_CEILING: f64 = 80.0;

/// Outcome of routing one save request
#[derive(Debug, Clone)]
pub struct GateAssignment {
    pub gate: Gate,
    pub scope: Scope,
    pub confidence: f64,
    /// Model-backed classification was expected but unavailable
    pub degraded: bool,
    /// What decided the gate: "rule", "caller" or a classifier name
    pub source: &'static str,
    pub triggered_rules: Vec<Uuid>,
    pub warnings: Vec<EngineWarning>,
}

/// Whether every word of the rule condition occurs in the content.
pub fn rule_matches(rule: &Rule, content: &str) -> bool {
    let condition = tokenize(&rule.condition);
    if condition.is_empty() {
        return false;
    }
    let words: HashSet<String> = tokenize(content).into_iter().collect();
    condition.iter().all(|term| words.contains(term))
}

fn default_scope(gate: Gate, project: Option<&str>) -> Scope {
    if gate == Gate::Correction {
        Scope::Global
    } else if project.is_some() {
        Scope::Project
    } else {
        Scope::User
    }
}

fn strength(enforcement: Enforcement) -> u8 {
    match enforcement {
        Enforcement::Enforce => 2,
        Enforcement::Warn => 1,
        Enforcement::Suggest => 0,
    }
}

/// Route a save request to a gate, scope and initial confidence.
pub async fn assign_gate(
    chain: &ClassifierChain,
    request: &SaveRequest,
    rules: &[Rule],
) -> GateAssignment {
    let mut matching: Vec<&Rule> = rules
        .iter()
        .filter(|r| rule_matches(r, &request.content))
        .collect();
    matching.sort_by(|a, b| {
        strength(b.enforcement)
            .cmp(&strength(a.enforcement))
            .then(a.created_at.cmp(&b.created_at))
    });

    let triggered_rules: Vec<Uuid> = matching.iter().map(|r| r.id).collect();
    let mut warnings: Vec<EngineWarning> = matching
        .iter()
        .filter(|r| r.enforcement == Enforcement::Warn)
        .map(|r| {
            EngineWarning::new(
                WarningKind::RuleWarning,
                format!("rule '{}' matched", r.condition),
            )
        })
        .collect();

    let enforced = matching
        .iter()
        .find(|r| r.enforcement == Enforcement::Enforce);
    let warned = matching.iter().find(|r| r.enforcement == Enforcement::Warn);
    let project = request.project.as_deref();

    // Enforce rules override everything, including the caller.
    if let Some(rule) = enforced {
        if let Some(gate) = rule.gate {
            return GateAssignment {
                gate,
                scope: request.scope.unwrap_or(rule.scope),
                confidence: RULE_GATE_CONFIDENCE,
                degraded: false,
                source: "rule",
                triggered_rules,
                warnings,
            };
        }
    }

    if let Some(gate) = request.gate {
        let confidence = if gate == Gate::Correction {
            RULE_GATE_CONFIDENCE
        } else {
            CALLER_GATE_CONFIDENCE
        };
        let forced_scope = enforced.or(warned).map(|r| r.scope);
        return GateAssignment {
            gate,
            scope: request
                .scope
                .or(forced_scope)
                .unwrap_or_else(|| default_scope(gate, project)),
            confidence,
            degraded: false,
            source: "caller",
            triggered_rules,
            warnings,
        };
    }

    if let Some(rule) = warned {
        if let Some(gate) = rule.gate {
            return GateAssignment {
                gate,
                scope: request.scope.unwrap_or(rule.scope),
                confidence: RULE_GATE_CONFIDENCE,
                degraded: false,
                source: "rule",
                triggered_rules,
                warnings,
            };
        }
    }

    let hints = GateHints {
        person: request.person.clone(),
        project: request.project.clone(),
    };
    let classified = chain.classify_gate(&request.content, &hints).await;
    let mut gate = classified.value.gate;
    let mut confidence = classified.value.confidence;

    let suggestion = matching
        .iter()
        .find(|r| r.enforcement == Enforcement::Suggest && r.gate.is_some())
        .and_then(|r| r.gate);
    if let Some(suggested) = suggestion {
        if suggested != gate && gate != Gate::Correction && confidence < SUGGESTION_OVERRIDE_CEILING
        {
            gate = suggested;
            confidence = confidence.max(SUGGESTED_GATE_CONFIDENCE);
        }
    }

    if classified.degraded {
        warnings.push(EngineWarning::new(
            WarningKind::ClassificationDegraded,
            "model-backed gate classifier unavailable; heuristic gate used",
        ));
    }

    let forced_scope = enforced.or(warned).map(|r| r.scope);
    GateAssignment {
        gate,
        scope: request
            .scope
            .or(forced_scope)
            .unwrap_or_else(|| default_scope(gate, project)),
        confidence: clamp_confidence(confidence),
        degraded: classified.degraded,
        source: classified.source,
        triggered_rules,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rule(condition: &str, enforcement: Enforcement, gate: Option<Gate>) -> Rule {
        Rule {
            id: Uuid::new_v4(),
            condition: condition.to_string(),
            scope: Scope::Project,
            enforcement,
            gate,
            created_at: Utc::now(),
            last_triggered: None,
        }
    }

    #[test]
    fn test_rule_matching_needs_every_word() {
        let r = rule("deploy friday", Enforcement::Suggest, None);
        assert!(rule_matches(&r, "We never deploy on a Friday"));
        assert!(!rule_matches(&r, "We deploy on Mondays"));
        assert!(!rule_matches(&rule("the", Enforcement::Suggest, None), "the cat"));
    }

    #[tokio::test]
    async fn test_heuristic_routing_and_default_scope() {
        let chain = ClassifierChain::heuristic_only();
        let a = assign_gate(&chain, &SaveRequest::new("user prefers dark mode"), &[]).await;
        assert_eq!(a.gate, Gate::Behavioral);
        assert_eq!(a.scope, Scope::User);
        assert!(!a.degraded);

        let c = assign_gate(
            &chain,
            &SaveRequest::new("the config key is database_url, not db_url"),
            &[],
        )
        .await;
        assert_eq!(c.gate, Gate::Correction);
        assert_eq!(c.scope, Scope::Global);
        assert!(c.confidence >= 90.0);

        let p = assign_gate(
            &chain,
            &SaveRequest::new("the api uses port 8080").with_project("atlas"),
            &[],
        )
        .await;
        assert_eq!(p.scope, Scope::Project);
    }

    #[tokio::test]
    async fn test_caller_gate_wins_over_heuristic() {
        let chain = ClassifierChain::heuristic_only();
        let req = SaveRequest::new("user prefers dark mode").with_gate(Gate::Epistemic);
        let a = assign_gate(&chain, &req, &[]).await;
        assert_eq!(a.gate, Gate::Epistemic);
        assert_eq!(a.confidence, CALLER_GATE_CONFIDENCE);
        assert_eq!(a.source, "caller");
    }

    #[tokio::test]
    async fn test_enforce_rule_overrides_caller() {
        let chain = ClassifierChain::heuristic_only();
        let r = rule("billing", Enforcement::Enforce, Some(Gate::Relational));
        let req = SaveRequest::new("billing is owned by finance").with_gate(Gate::Epistemic);
        let a = assign_gate(&chain, &req, std::slice::from_ref(&r)).await;
        assert_eq!(a.gate, Gate::Relational);
        assert_eq!(a.scope, Scope::Project);
        assert_eq!(a.confidence, RULE_GATE_CONFIDENCE);
        assert_eq!(a.triggered_rules, vec![r.id]);
        assert!(a.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_warn_rule_forces_and_warns() {
        let chain = ClassifierChain::heuristic_only();
        let r = rule("standup", Enforcement::Warn, Some(Gate::Promissory));
        let a = assign_gate(&chain, &SaveRequest::new("standup moved to 10am"), &[r]).await;
        assert_eq!(a.gate, Gate::Promissory);
        assert_eq!(a.warnings.len(), 1);
        assert_eq!(a.warnings[0].kind, WarningKind::RuleWarning);
    }

    #[tokio::test]
    async fn test_suggest_rule_biases_weak_verdicts_only() {
        let chain = ClassifierChain::heuristic_only();
        let r = rule("garden", Enforcement::Suggest, Some(Gate::Behavioral));
        let weak = assign_gate(&chain, &SaveRequest::new("garden tomatoes"), &[r.clone()]).await;
        assert_eq!(weak.gate, Gate::Behavioral);

        let correction = assign_gate(
            &chain,
            &SaveRequest::new("actually the garden is north facing"),
            &[r],
        )
        .await;
        assert_eq!(correction.gate, Gate::Correction);
    }
}
