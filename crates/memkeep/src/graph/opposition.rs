//! Text heuristics for conflicting claims and continuations

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::storage::lexical::tokenize;

static REJECTED_TERM: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i),\s*not\s+([A-Za-z0-9_./:-]+)",
        r"(?i)\binstead of\s+(?:the\s+)?([A-Za-z0-9_./:-]+)",
        r"(?i)\brather than\s+(?:the\s+)?([A-Za-z0-9_./:-]+)",
        r"(?i)\bno longer\s+(?:uses?|using|called|named)?\s*([A-Za-z0-9_./:-]+)",
        // bare "not X" only when X looks like an identifier or value
        r"(?i)\bnot\s+([A-Za-z0-9]*[_./:0-9][A-Za-z0-9_./:-]*)",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static NEGATION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(not|never|no|don'?t|doesn'?t|isn'?t|aren'?t|won'?t|can'?t|cannot|shouldn'?t)\b",
    )
    .ok()
});

static ASSIGNMENT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?P<subject>.+?)\s+(?:is|are|=|equals|is set to)\s+(?P<value>.+)$").ok()
});

static CONTINUATION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(as promised|following up|follow-up on|followed up|next step|continuing|continued|done with|completed|finished|as planned|picked up where|step \d+|part \d+)\b",
    )
    .ok()
});

/// Terms a correction explicitly rejects ("X, not db_url" yields `db_url`).
pub fn rejected_terms(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for regex in REJECTED_TERM.iter() {
        for caps in regex.captures_iter(content) {
            let Some(m) = caps.get(1) else { continue };
            let term = m
                .as_str()
                .trim_matches(|c: char| !c.is_alphanumeric() && c != '_')
                .to_lowercase();
            if term.chars().count() < 2 || tokenize(&term).is_empty() {
                continue;
            }
            if seen.insert(term.clone()) {
                out.push(term);
            }
        }
    }
    out
}

fn is_negated(content: &str) -> bool {
    NEGATION.as_ref().is_some_and(|r| r.is_match(content))
}

fn term_set(content: &str) -> HashSet<String> {
    let stripped = match NEGATION.as_ref() {
        Some(r) => r.replace_all(content, " ").into_owned(),
        None => content.to_string(),
    };
    tokenize(&stripped).into_iter().collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    inter / union
}

fn assignment(content: &str) -> Option<(HashSet<String>, HashSet<String>)> {
    let caps = ASSIGNMENT.as_ref()?.captures(content.trim().trim_end_matches('.'))?;
    let subject: HashSet<String> = tokenize(caps.name("subject")?.as_str()).into_iter().collect();
    let value: HashSet<String> = tokenize(caps.name("value")?.as_str()).into_iter().collect();
    if subject.is_empty() || value.is_empty() {
        return None;
    }
    Some((subject, value))
}

/// Whether two statements make conflicting claims about the same subject.
///
/// Either the same claim with opposite polarity, or the same subject
/// assigned a disjoint value.
pub fn conflicts(newer: &str, older: &str) -> bool {
    if is_negated(newer) != is_negated(older) && jaccard(&term_set(newer), &term_set(older)) >= 0.6
    {
        return true;
    }
    match (assignment(newer), assignment(older)) {
        (Some((subject_a, value_a)), Some((subject_b, value_b))) => {
            subject_a == subject_b && value_a.is_disjoint(&value_b)
        }
        _ => false,
    }
}

/// Whether content explicitly continues an earlier commitment.
pub fn continues_commitment(content: &str) -> bool {
    CONTINUATION.as_ref().is_some_and(|r| r.is_match(content))
}

/// Shared index terms of two texts
pub fn shared_terms(a: &str, b: &str) -> usize {
    let a: HashSet<String> = tokenize(a).into_iter().collect();
    let b: HashSet<String> = tokenize(b).into_iter().collect();
    a.intersection(&b).count()
}
