//! Error types for the financial report pipeline

use crate::models::RunStatus;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {

    // =============================
    // Run-fatal Pipeline Errors
    // =============================

    #[error("No documents found")]
    NoDocuments,

    #[error("No text extracted from documents")]
    NoTextExtracted,

    #[error("Execution error: {0}")]
    ExecutionError(String),

    // =============================
    // Collaborator Errors
    // =============================

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Document error: {0}")]
    DocumentError(String),

    #[error("State persistence error: {0}")]
    StateError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Prompt error: {0}")]
    PromptError(String),

    #[error("Invalid run transition: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_fatal_messages_are_user_facing() {
        assert_eq!(PipelineError::NoDocuments.to_string(), "No documents found");
        assert_eq!(
            PipelineError::NoTextExtracted.to_string(),
            "No text extracted from documents"
        );
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = PipelineError::InvalidTransition {
            from: RunStatus::Completed,
            to: RunStatus::Running,
        };
        assert_eq!(err.to_string(), "Invalid run transition: completed -> running");
    }
}
