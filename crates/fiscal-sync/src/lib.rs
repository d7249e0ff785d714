//! # fiscal-sync: Authority Submission & Contingency Engine
//!
//! Gets finalized fiscal documents accepted by the tax authority, and keeps
//! the books straight when the authority cannot be reached.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Document Lifecycle                              │
//! │                                                                         │
//! │  finalize ──► SubmissionPipeline ──► accepted / rejected                │
//! │                     │                                                   │
//! │                     │ unreachable or retries exhausted                  │
//! │                     ▼                                                   │
//! │              ContingencyManager                                         │
//! │              assign to the scope's active period                        │
//! │                     │                                                   │
//! │                     │ close (operator or scheduled)                     │
//! │                     ▼                                                   │
//! │              notification event ──► period closed                       │
//! │                     │                                                   │
//! │                     ▼                                                   │
//! │              LoteBatcher ──► lotes of ≤ 100 ──► submitted               │
//! │                     │                                                   │
//! │                     ▼                                                   │
//! │              LotePoller ──► per-document accept / reject                │
//! │                                                                         │
//! │  ReconciliationEngine audits the result against the authority.          │
//! │  ContingencyAgent runs the close, batch and poll sweeps.                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Authority
//! - [`gateway`] - `AuthorityGateway` trait and failure taxonomy
//! - [`http_gateway`] - REST implementation over reqwest
//! - [`auth`] - Token cache for the REST gateway
//! - [`simulated`] - Scriptable in-memory authority
//! - [`retry`] - Bounded exponential backoff around gateway calls
//!
//! ### Engine
//! - [`pipeline`] - Direct submission with contingency fallback
//! - [`contingency`] - Period lifecycle and notification delivery
//! - [`batcher`] - Lote building and submission
//! - [`poller`] - Lote status polling
//! - [`reconcile`] - Read-only audit and CSV export
//! - [`engine`] - Component wiring from configuration
//!
//! ### Operation
//! - [`admin`] - Operator surface
//! - [`worker`] - Periodic sweep loops
//! - [`agent`] - Background orchestrator
//! - [`config`] - TOML configuration with environment overrides
//! - [`error`] - Engine error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fiscal_sync::{build_gateway, ContingencyAgentBuilder, FiscalConfig};
//!
//! let config = FiscalConfig::load_or_default(None);
//! let gateway = build_gateway(&config)?;
//!
//! let mut agent = ContingencyAgentBuilder::new(config)
//!     .with_database(db)
//!     .with_gateway(gateway)
//!     .build()?;
//! agent.start().await?;
//!
//! let outcome = agent.engine().pipeline.finalize(document).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod auth;
pub mod gateway;
pub mod http_gateway;
pub mod retry;
pub mod simulated;

pub mod batcher;
pub mod contingency;
pub mod engine;
pub mod pipeline;
pub mod poller;
pub mod reconcile;

pub mod admin;
pub mod agent;
pub mod config;
pub mod error;
pub mod worker;

// =============================================================================
// Re-exports
// =============================================================================

pub use admin::{AdminClose, AdminService, DocumentTrace, LoteDetail, PeriodDetail};
pub use agent::{AgentEventEmitter, AgentStatus, ContingencyAgent, ContingencyAgentBuilder, ContingencyAgentHandle};
pub use batcher::{LoteBatcher, LoteReport, LoteSubmission};
pub use config::{AuthorityMode, FiscalConfig};
pub use contingency::{CloseOutcome, ContingencyManager, EventSigner, NotificationStatus, PassthroughSigner};
pub use engine::{build_gateway, FiscalEngine};
pub use error::{SyncError, SyncResult};
pub use gateway::{AuthorityError, AuthorityGateway, FailureClass};
pub use http_gateway::HttpAuthorityGateway;
pub use pipeline::{SubmissionOutcome, SubmissionPipeline};
pub use poller::{LotePoller, PollOutcome, PollResult};
pub use reconcile::{export_csv, ReconcileOptions, ReconciliationEngine, ReconciliationReport};
pub use simulated::{Operation, SimulatedAuthority};
pub use worker::{Sweep, SweepSummary, SweepWorker, SweepWorkerHandle};
