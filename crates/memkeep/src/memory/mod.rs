//! Memory records and their satellites
//!
//! `types` holds the memory record and its enums; `records` the edges,
//! journal entries, rules and identity document that hang off it.

pub mod records;
pub mod types;

pub use records::{
    Edge, EngineWarning, IdentityDocument, JournalEntry, Neighbor, RelationType, Rule,
    WarningKind,
};
pub use types::{
    DecayClass, Gate, IndexState, Memory, MemoryPatch, SaveRequest, Scope, Sensitivity,
};
