//! # Database Error Types
//!
//! Error types for database operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError (this module) ← constraint / trigger / guard categorization   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError::Database (fiscal-sync) ← decides retry vs. report          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Guarded updates (`... WHERE id = ? AND status = ?`) that touch no row
//! surface as [`DbError::PreconditionFailed`], so callers can tell "someone
//! else already moved this record" apart from "this record never existed".

use thiserror::Error;

/// Prefix used by the schema triggers that enforce cross-row invariants.
pub const INVARIANT_PREFIX: &str = "invariant violation:";

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Entity not found in database.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Unique constraint violation.
    ///
    /// ## When This Occurs
    /// - Duplicate generation code
    /// - A second active period for a scope
    /// - A second notification event for a period
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// Foreign key constraint violation.
    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    /// A guarded update matched no row: the record exists but is not in the
    /// state the caller expected.
    #[error("{entity} {id} is not {expected}")]
    PreconditionFailed {
        entity: String,
        id: String,
        expected: String,
    },

    /// A schema trigger rejected the write (append-only tables, lote scope).
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Database connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// A stored value could not be mapped back into a domain type.
    #[error("Corrupt {column} value: {message}")]
    Decode { column: String, message: String },

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a UniqueViolation error.
    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        DbError::UniqueViolation {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn precondition(
        entity: impl Into<String>,
        id: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        DbError::PreconditionFailed {
            entity: entity.into(),
            id: id.into(),
            expected: expected.into(),
        }
    }

    pub fn decode(column: impl Into<String>, message: impl ToString) -> Self {
        DbError::Decode {
            column: column.into(),
            message: message.to_string(),
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, DbError::UniqueViolation { .. })
    }

    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, DbError::PreconditionFailed { .. })
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, DbError::InvariantViolation(_))
    }

    /// Lock contention and pool pressure clear up on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::PoolExhausted => true,
            DbError::QueryFailed(msg) => msg.contains("database is locked") || msg.contains("busy"),
            _ => false,
        }
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → constraint / trigger message analysis
/// sqlx::Error::PoolTimedOut   → DbError::PoolExhausted
/// sqlx::Error::ColumnDecode   → DbError::Decode
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                // "UNIQUE constraint failed: <table>.<column>[, <table>.<column>]"
                if msg.contains("UNIQUE constraint failed") {
                    let field = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    DbError::UniqueViolation {
                        field,
                        value: "unknown".to_string(),
                    }
                } else if msg.contains("FOREIGN KEY constraint failed") {
                    DbError::ForeignKeyViolation {
                        message: msg.to_string(),
                    }
                } else if let Some(rest) = msg.strip_prefix(INVARIANT_PREFIX) {
                    DbError::InvariantViolation(rest.trim().to_string())
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            sqlx::Error::ColumnDecode { index, source } => DbError::Decode {
                column: index,
                message: source.to_string(),
            },

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<fiscal_core::CoreError> for DbError {
    fn from(err: fiscal_core::CoreError) -> Self {
        DbError::Decode {
            column: "enum".to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;
