//! Prompts for the model-backed classifier
//!
//! Every prompt asks for a single JSON object so the response can be parsed
//! without free-text heuristics.

/// Gate routing prompt
///
/// Placeholders: {content}, {hints}
pub const GATE_PROMPT: &str = r#"Classify the following statement an assistant was asked to remember into exactly one gate:

- "behavioral": preferences, habits, likes and dislikes
- "relational": people, roles, teams, ownership
- "epistemic": facts and technical knowledge
- "promissory": commitments or plans about the future
- "correction": explicitly corrects or replaces earlier information ("don't", "actually", "that's wrong", "X, not Y")

Correction takes priority over any other gate when correction language is present.

Hints: {hints}

Statement:
{content}

Respond with ONLY a JSON object: {"gate": "<gate>", "confidence": <number between 1 and 99>}"#;

/// Privacy review prompt
///
/// Placeholder: {content}
pub const SENSITIVITY_PROMPT: &str = r#"Assess the privacy risk of storing the following statement in a long-term memory store.

- "safe": nothing personal or confidential
- "sensitive": personal details such as health, finances, relationships, location or beliefs
- "critical": secrets, credentials, government identifiers or payment data

Statement:
{content}

Respond with ONLY a JSON object: {"level": "<safe|sensitive|critical>", "reason": "<one short sentence>"}"#;

/// Identity section summarization prompt
///
/// Placeholders: {heading}, {items}
pub const SUMMARY_PROMPT: &str = r#"Write a short, neutral paragraph for the "{heading}" section of a user profile, using only the facts below. Do not invent details.

Facts:
{items}

Respond with ONLY the paragraph."#;

/// Transcript extraction prompt
///
/// Placeholder: {transcript}
pub const EXTRACTION_PROMPT: &str = r#"Read the conversation transcript below and pick out the few statements worth remembering long term. Each one must fit a gate:

- "behavioral": a preference or habit that should change how the assistant acts next time
- "relational": something about a person, their role or their team
- "epistemic": a fact, lesson or surprise worth knowing later
- "promissory": a commitment or follow-up
- "correction": something that replaces earlier information

Be selective; most conversations hold zero to three memories. Write each memory as one standalone sentence.

Transcript:
{transcript}

Respond with ONLY a JSON object: {"memories": [{"content": "<sentence>", "gate": "<gate>", "person": "<name or null>", "project": "<name or null>"}]}. Use {"memories": []} when nothing is worth keeping."#;
