use thiserror::Error;

use crate::models::ConflictPair;

/// Top-level application error. All variants carry a human-readable message
/// for display/logging.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Database errors ──────────────────────────────────────────────────────
    #[error("Database query failed: {message}")]
    DatabaseQueryFailed {
        message: String,
        #[source]
        source: sqlx::Error,
    },

    // ── Lookup errors ────────────────────────────────────────────────────────
    #[error("Conversation '{id}' not found")]
    ConversationNotFound { id: String },

    #[error("Message '{id}' not found")]
    MessageNotFound { id: String },

    #[error("Branch '{name}' not found")]
    BranchNotFound { name: String },

    // ── Branching errors ─────────────────────────────────────────────────────
    #[error("Branch '{name}' already exists")]
    BranchExists { name: String },

    #[error("Invalid operation: {reason}")]
    InvalidOperation { reason: String },

    /// Appending under a superseded message without an explicit fork.
    #[error("Message '{id}' is superseded; fork from it instead of appending")]
    InvalidParent { id: String },

    #[error("Branch '{branch}' was advanced concurrently (expected version {expected})")]
    VersionConflict { branch: String, expected: i64 },

    #[error("Merge aborted: {} conflicting message pair(s)", .conflicts.len())]
    MergeConflict { conflicts: Vec<ConflictPair> },

    /// Tree corruption. Indicates a bug, never contention; not retryable.
    #[error("Invariant violation: {detail}")]
    InvariantViolation { detail: String },

    // ── AI Agent errors ──────────────────────────────────────────────────────
    #[error("Ollama service unavailable at {host}")]
    OllamaUnavailable { host: String },

    #[error("Model '{model_name}' not found in Ollama")]
    ModelNotFound { model_name: String },

    #[error("Inference error: {message}")]
    InferenceError { message: String },

    // ── Validation errors ────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong { field_name: String, max_length: usize, actual_length: usize },

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn db_query(message: impl Into<String>, source: sqlx::Error) -> Self {
        AppError::DatabaseQueryFailed { message: message.into(), source }
    }

    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        AppError::InvalidOperation { reason: reason.into() }
    }

    pub fn invariant(detail: impl Into<String>) -> Self {
        AppError::InvariantViolation { detail: detail.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AppError::ConversationNotFound { .. }
                | AppError::MessageNotFound { .. }
                | AppError::BranchNotFound { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            AppError::BranchExists { .. }
                | AppError::VersionConflict { .. }
                | AppError::MergeConflict { .. }
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AppError::EmptyField { .. } | AppError::FieldTooLong { .. })
    }

    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, AppError::InvalidOperation { .. } | AppError::InvalidParent { .. })
    }

    pub fn is_agent_unavailable(&self) -> bool {
        matches!(self, AppError::OllamaUnavailable { .. })
    }
}
