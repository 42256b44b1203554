//! Sensitivity and PII scanning

pub mod patterns;
pub mod scanner;

use serde::Serialize;
use uuid::Uuid;

pub use patterns::{PiiKind, luhn_valid};
pub use scanner::{ScanOutcome, SensitivityScanner};

/// A stored memory whose content matches stage 1 patterns
#[derive(Debug, Clone, Serialize)]
pub struct PiiFinding {
    pub id: Uuid,
    pub kinds: Vec<PiiKind>,
    pub preview: String,
}
