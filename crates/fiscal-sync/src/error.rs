//! # Engine Error Types
//!
//! Errors surfaced by the submission / contingency engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Engine Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Authority     │  │  Local invariants       │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Authority(..)  │  │  InvalidTransition      │ │
//! │  │  InvalidUrl     │  │  Rejected       │  │  ScopeMismatch          │ │
//! │  │  ConfigLoad/Save│  │                 │  │  Core / Database(..)    │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Lookups      │  │    Export       │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  NotFound       │  │  ExportFailed   │  │  ShuttingDown           │ │
//! │  │                 │  │  Serialization  │  │  Internal               │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transient and unavailable authority failures are absorbed by the pipeline,
//! batcher and poller; what reaches a caller is either a definitive rejection
//! or a local problem.

use thiserror::Error;

use crate::gateway::{AuthorityError, FailureClass};
use fiscal_core::{CoreError, ValidationError};
use fiscal_db::DbError;

/// Result type alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Authority Errors
    // =========================================================================
    /// A gateway failure that was not absorbed.
    #[error(transparent)]
    Authority(#[from] AuthorityError),

    // =========================================================================
    // Local Invariant Errors
    // =========================================================================
    /// The document, period or lote is not in a status that allows the
    /// operation.
    #[error("{entity} {id} is {actual}; {operation} requires {expected}")]
    InvalidTransition {
        entity: String,
        id: String,
        operation: String,
        actual: String,
        expected: String,
    },

    /// Every re-resolved active period was closed before the document could
    /// be attached to it.
    #[error("Document {document_id} could not join an active contingency period after {attempts} attempts")]
    AssignmentExhausted { document_id: String, attempts: u32 },

    /// Domain rule violated (mixed scope, invalid input).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Persisted state refused the change or could not be read.
    #[error(transparent)]
    Database(#[from] DbError),

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    // =========================================================================
    // Export Errors
    // =========================================================================
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Export failed: {0}")]
    ExportFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    /// Agent is shutting down.
    #[error("Contingency agent is shutting down")]
    ShuttingDown,
}

impl SyncError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        SyncError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn invalid_transition(
        entity: impl Into<String>,
        id: impl Into<String>,
        operation: impl Into<String>,
        actual: impl std::fmt::Display,
        expected: impl Into<String>,
    ) -> Self {
        SyncError::InvalidTransition {
            entity: entity.into(),
            id: id.into(),
            operation: operation.into(),
            actual: actual.to_string(),
            expected: expected.into(),
        }
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        SyncError::Core(CoreError::Validation(err))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<csv::Error> for SyncError {
    fn from(err: csv::Error) -> Self {
        SyncError::ExportFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the operation may succeed when simply tried again.
    ///
    /// ## Retryable Errors
    /// - Transient or unavailable authority failures
    /// - A busy / locked database
    ///
    /// ## Non-Retryable Errors
    /// - Authority rejections
    /// - Configuration errors
    /// - Local invariant violations
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Authority(e) => e.failure_class() != FailureClass::Rejection,
            SyncError::Database(e) => e.is_transient(),
            SyncError::AssignmentExhausted { .. } => true,
            _ => false,
        }
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true for local invariant violations: illegal transitions,
    /// mixed-scope lotes, double-open periods and guarded updates that found
    /// the row in an unexpected status.
    pub fn is_invariant_violation(&self) -> bool {
        match self {
            SyncError::InvalidTransition { .. } => true,
            SyncError::Core(CoreError::InvalidTransition { .. } | CoreError::ScopeMismatch { .. }) => true,
            SyncError::Database(e) => {
                e.is_invariant_violation() || e.is_precondition_failed() || e.is_unique_violation()
            }
            _ => false,
        }
    }

    /// Returns true if the authority definitively refused the request.
    pub fn is_rejection(&self) -> bool {
        matches!(self, SyncError::Authority(e) if e.is_rejection())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::from(AuthorityError::Timeout(Duration::from_secs(60))).is_retryable());
        assert!(SyncError::from(AuthorityError::RateLimited).is_retryable());
        assert!(SyncError::from(DbError::PoolExhausted).is_retryable());

        assert!(!SyncError::from(AuthorityError::rejected("HTTP_400", "bad")).is_retryable());
        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
    }

    #[test]
    fn test_invariant_violations() {
        let mixed = SyncError::from(CoreError::ScopeMismatch {
            generation_code: "ABC".into(),
            expected: "a".into(),
            found: "b".into(),
        });
        assert!(mixed.is_invariant_violation());

        let guard = SyncError::from(DbError::precondition("period", "p-1", "active"));
        assert!(guard.is_invariant_violation());

        let trigger = SyncError::from(DbError::InvariantViolation(
            "invariant violation: document scope differs from lote scope".into(),
        ));
        assert!(trigger.is_invariant_violation());

        assert!(!SyncError::not_found("lote", "x").is_invariant_violation());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::invalid_transition("document", "doc-1", "submit", "accepted", "finalized");
        let text = err.to_string();
        assert!(text.contains("doc-1"));
        assert!(text.contains("accepted"));
        assert!(text.contains("finalized"));

        assert!(SyncError::InvalidUrl("nope".into()).is_config_error());
    }
}
