//! # fiscal-db: Database Layer
//!
//! SQLite persistence for the fiscal submission core, built on sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  fiscal-sync (pipeline, contingency manager, batcher, poller, ...)     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     fiscal-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────────┐  ┌────────────┐  │   │
//! │  │   │   Database    │    │   Repositories     │  │ Migrations │  │   │
//! │  │   │   (pool.rs)   │◄───│ DocumentRepository │  │ (embedded) │  │   │
//! │  │   │               │    │ PeriodRepository   │  │            │  │   │
//! │  │   │ SqlitePool    │    │ EventRepository    │  │ 001_...sql │  │   │
//! │  │   │               │    │ LoteRepository     │  │            │  │   │
//! │  │   └───────────────┘    └────────────────────┘  └────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (WAL)                                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency contract
//!
//! Every state transition is a single guarded statement
//! (`UPDATE ... WHERE id = ? AND status = ?`) or a transaction; a guard that
//! matches nothing returns [`DbError::PreconditionFailed`]. "One active period
//! per scope" is a partial unique index, so concurrent creators cannot both
//! win.

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::document::{DocumentRepository, StatusCount};
pub use repository::event::{EventFilter, EventRepository};
pub use repository::lote::{AppliedResults, LoteFilter, LoteRepository};
pub use repository::period::{PeriodFilter, PeriodRepository};
