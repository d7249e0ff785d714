//! # Repository Module
//!
//! One repository per table. Each owns a pool clone and exposes the queries
//! and guarded transitions the engine needs; none of them contain retry or
//! authority logic.
//!
//! - [`DocumentRepository`](document::DocumentRepository) - documents and their authority fields
//! - [`PeriodRepository`](period::PeriodRepository) - contingency periods and sweep claims
//! - [`EventRepository`](event::EventRepository) - contingency notifications
//! - [`LoteRepository`](lote::LoteRepository) - lotes and their document membership

pub mod document;
pub mod event;
pub mod lote;
pub mod period;

use chrono::{DateTime, Utc};

/// Claims older than this are considered abandoned by a crashed sweep.
pub(crate) fn claim_cutoff(now: DateTime<Utc>, ttl: std::time::Duration) -> DateTime<Utc> {
    now - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::NaiveDate;
    use fiscal_core::{DocumentKind, Environment, NewDocument, Scope};

    use crate::{Database, DbConfig};

    pub async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    pub fn scope() -> Scope {
        Scope::new("company-1", "M001", "P001", Environment::Test)
    }

    pub fn new_document(scope: &Scope, n: u32) -> NewDocument {
        NewDocument {
            generation_code: None,
            control_number: format!("DTE-01-M001P001-{:015}", n),
            kind: DocumentKind::Invoice,
            scope: scope.clone(),
            issued_on: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            signed_payload: format!("signed-{}", n),
        }
    }
}
