//! # Error Types
//!
//! Domain-specific error types for fiscal-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  CoreError                                                              │
//! │  ├── InvalidTransition    (document / period / lote state machines)     │
//! │  ├── ScopeMismatch        (lote containing foreign documents)           │
//! │  ├── UnknownCode          (environment, kind, contingency type)         │
//! │  └── Validation ──────►   ValidationError                              │
//! │                           ├── Required                                  │
//! │                           ├── TooLong                                   │
//! │                           ├── OutOfRange                                │
//! │                           └── InvalidFormat                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every `CoreError` except `Validation` is a local invariant violation:
//! a bug or a corrupted record, never something the authority caused.

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Domain rule violations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A status change the state machine does not allow.
    ///
    /// ## When This Occurs
    /// - Submitting a document that is already accepted
    /// - Closing a period that is not active
    /// - Completing a lote that was never submitted
    #[error("{entity} {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        entity: String,
        id: String,
        from: String,
        to: String,
    },

    /// A document does not belong to the scope of the lote or period it is
    /// being grouped into.
    #[error("Document {generation_code} has scope {found}, expected {expected}")]
    ScopeMismatch {
        generation_code: String,
        expected: String,
        found: String,
    },

    /// A wire or catalogue code that is not recognised.
    #[error("Unknown {kind} code: '{code}'")]
    UnknownCode { kind: String, code: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Creates an InvalidTransition error.
    pub fn invalid_transition(
        entity: impl Into<String>,
        id: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        CoreError::InvalidTransition {
            entity: entity.into(),
            id: id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Creates an UnknownCode error.
    pub fn unknown_code(kind: impl Into<String>, code: impl Into<String>) -> Self {
        CoreError::UnknownCode {
            kind: kind.into(),
            code: code.into(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., invalid UUID, reversed date range).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_message() {
        let err = CoreError::invalid_transition("Period", "p-1", "closed", "reporting");
        assert_eq!(err.to_string(), "Period p-1: cannot move from closed to reporting");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let err: CoreError = ValidationError::Required {
            field: "company_id".to_string(),
        }
        .into();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(err.to_string(), "Validation error: company_id is required");
    }
}
