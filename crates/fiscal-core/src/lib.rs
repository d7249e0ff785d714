//! # fiscal-core: Pure Domain Logic
//!
//! Everything about fiscal documents, contingency periods and lotes that can
//! be decided without touching a database or the tax authority.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   fiscal-sync (pipeline, batcher, poller, reconciliation)              │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   fiscal-db (repositories)                                             │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   ┌─────────────────────────────────────────────────────────────────┐  │
//! │   │                 fiscal-core (THIS CRATE)                        │  │
//! │   │                                                                 │  │
//! │   │  types        Document, ContingencyPeriod, Lote, statuses       │  │
//! │   │  validation   scope / batch / contingency rules                 │  │
//! │   │  retry        RetryPolicy (retry budget as plain data)          │  │
//! │   │  notice       contingency notification document                 │  │
//! │   │  reconcile    local vs authority comparison                     │  │
//! │   └─────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use fiscal_core::{DocumentStatus, PeriodStatus};
//!
//! assert!(DocumentStatus::Finalized.can_transition_to(DocumentStatus::Submitting));
//! assert!(!DocumentStatus::Accepted.can_transition_to(DocumentStatus::Submitting));
//! assert!(PeriodStatus::Active.can_transition_to(PeriodStatus::Reporting));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod notice;
pub mod reconcile;
pub mod retry;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use notice::ContingencyNotice;
pub use reconcile::{
    Classification, QueryStatus, ReconciliationRecord, ReconciliationSummary, RemoteDocumentStatus,
};
pub use retry::RetryPolicy;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Largest lote the authority accepts in a single batch submission.
pub const MAX_AUTHORITY_BATCH_SIZE: usize = 100;

/// Longest free-text contingency reason the authority accepts.
pub const MAX_CONTINGENCY_REASON_LEN: usize = 500;

/// Authority state for a document it processed and accepted.
pub const STATE_PROCESSED: &str = "PROCESADO";

/// Authority state for a document it rejected.
pub const STATE_REJECTED: &str = "RECHAZADO";

/// Authority state for a received contingency notification.
pub const STATE_RECEIVED: &str = "RECIBIDO";
