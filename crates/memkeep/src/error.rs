//! Error types for memkeep

use serde::Serialize;
use thiserror::Error;

/// Main error type for memkeep operations
#[derive(Error, Debug)]
pub enum MemkeepError {
    /// Malformed input, rejected before anything is written
    #[error("Validation error: {0}")]
    Validation(String),

    /// Model-backed classifier unavailable; heuristic results were used instead
    #[error("Classification degraded: {0}")]
    ClassificationDegraded(String),

    /// Embedding or index write failed; the record exists but is not searchable yet
    #[error("Indexing lag: {0}")]
    IndexingLag(String),

    /// Metadata store failure (SQLite, LanceDB, Qdrant, file system)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Unknown memory, rule or edge id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Embedding generation errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Classifier provider errors that escaped the fallback chain
    #[error("Classifier error: {0}")]
    Classifier(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another reflection cycle holds the cycle lock
    #[error("A reflection cycle is already running")]
    ReflectionInProgress,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl MemkeepError {
    /// Stable, machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            MemkeepError::Validation(_) => "validation_error",
            MemkeepError::ClassificationDegraded(_) => "classification_degraded",
            MemkeepError::IndexingLag(_) => "indexing_lag",
            MemkeepError::Storage(_) | MemkeepError::Io(_) => "storage_error",
            MemkeepError::NotFound(_) => "not_found",
            MemkeepError::Embedding(_) => "embedding_error",
            MemkeepError::Classifier(_) => "classifier_error",
            MemkeepError::Config(_) => "config_error",
            MemkeepError::ReflectionInProgress => "reflection_in_progress",
            MemkeepError::Serialization(_) => "serialization_error",
        }
    }

    /// Whether the failure leaves the authoritative record intact.
    pub fn is_degradation(&self) -> bool {
        matches!(
            self,
            MemkeepError::ClassificationDegraded(_) | MemkeepError::IndexingLag(_)
        )
    }
}

impl From<rusqlite::Error> for MemkeepError {
    fn from(e: rusqlite::Error) -> Self {
        MemkeepError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for MemkeepError {
    fn from(e: serde_json::Error) -> Self {
        MemkeepError::Serialization(e.to_string())
    }
}

/// Machine-readable error body returned at the API boundary
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}

impl From<&MemkeepError> for ErrorBody {
    fn from(e: &MemkeepError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Result type alias for memkeep operations
pub type Result<T> = std::result::Result<T, MemkeepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(
            MemkeepError::Validation("x".into()).kind(),
            "validation_error"
        );
        assert_eq!(MemkeepError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(MemkeepError::IndexingLag("x".into()).kind(), "indexing_lag");
        assert_eq!(
            MemkeepError::ClassificationDegraded("x".into()).kind(),
            "classification_degraded"
        );
        assert_eq!(MemkeepError::Storage("x".into()).kind(), "storage_error");
    }

    #[test]
    fn test_degradations() {
        assert!(MemkeepError::IndexingLag("x".into()).is_degradation());
        assert!(MemkeepError::ClassificationDegraded("x".into()).is_degradation());
        assert!(!MemkeepError::Storage("x".into()).is_degradation());
    }

    #[test]
    fn test_error_body_from_error() {
        let err = MemkeepError::NotFound("memory 123".into());
        let body = ErrorBody::from(&err);
        assert_eq!(body.kind, "not_found");
        assert!(body.message.contains("memory 123"));
    }

    #[test]
    fn test_sqlite_errors_map_to_storage() {
        let err: MemkeepError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.kind(), "storage_error");
    }
}
