//! # Admin Service
//!
//! The operator's read/operate surface: periods, lotes, notifications,
//! reconciliation and per-document traces. The daemon's subcommands are thin
//! wrappers around these methods.

use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tracing::info;

use fiscal_core::{
    ContingencyEvent, ContingencyPeriod, DateRange, Document, Lote, PeriodStatus,
    ReconciliationRecord, Scope,
};
use fiscal_db::{Database, EventFilter, LoteFilter, PeriodFilter, StatusCount};

use crate::batcher::LoteReport;
use crate::contingency::CloseOutcome;
use crate::engine::FiscalEngine;
use crate::error::{SyncError, SyncResult};
use crate::poller::PollResult;
use crate::reconcile::{export_csv, ReconcileOptions, ReconciliationReport};

/// A period with its notification, document breakdown and lotes.
#[derive(Debug, Clone, Serialize)]
pub struct PeriodDetail {
    pub period: ContingencyPeriod,
    pub event: Option<ContingencyEvent>,
    pub documents: Vec<StatusCount>,
    pub lotes: Vec<Lote>,
}

/// A lote with its documents' status breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct LoteDetail {
    pub lote: Lote,
    pub documents: Vec<StatusCount>,
    pub generation_codes: Vec<String>,
}

/// Everything known about one document's way to the authority.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentTrace {
    pub document: Document,
    pub period: Option<ContingencyPeriod>,
    pub event: Option<ContingencyEvent>,
    pub lote: Option<Lote>,
}

/// Result of an operator close.
#[derive(Debug, Clone, Serialize)]
pub struct AdminClose {
    #[serde(flatten)]
    pub close: CloseOutcome,
    /// Lotes built right away when the notification was accepted.
    pub lotes: Vec<LoteReport>,
}

#[derive(Clone)]
pub struct AdminService {
    db: Arc<Database>,
    engine: FiscalEngine,
}

impl AdminService {
    pub fn new(db: Arc<Database>, engine: FiscalEngine) -> Self {
        AdminService { db, engine }
    }

    // =========================================================================
    // Periods
    // =========================================================================

    pub async fn list_periods(&self, filter: &PeriodFilter) -> SyncResult<Vec<ContingencyPeriod>> {
        Ok(self.db.periods().list(filter).await?)
    }

    pub async fn get_period(&self, id: &str) -> SyncResult<PeriodDetail> {
        let period = self
            .db
            .periods()
            .get_by_id(id)
            .await?
            .ok_or_else(|| SyncError::not_found("Period", id))?;
        let event = self.db.events().get_for_period(id).await?;
        let documents = self.db.documents().status_breakdown_for_period(id).await?;
        let lotes = self
            .db
            .lotes()
            .list(&LoteFilter {
                period_id: Some(id.to_string()),
                ..Default::default()
            })
            .await?;

        Ok(PeriodDetail {
            period,
            event,
            documents,
            lotes,
        })
    }

    /// Closes an active period now. When the authority accepts the
    /// notification the period's lotes are built and submitted in the same
    /// call; otherwise the background sweeps take over.
    pub async fn close_period(&self, id: &str) -> SyncResult<AdminClose> {
        info!(period_id = %id, "Operator close requested");
        let close = self.engine.contingency.close_period(id).await?;
        let lotes = if close.period.status == PeriodStatus::Closed {
            self.engine.batcher.build(id).await?
        } else {
            Vec::new()
        };
        Ok(AdminClose { close, lotes })
    }

    pub async fn periods_needing_attention(&self) -> SyncResult<Vec<ContingencyPeriod>> {
        self.engine.contingency.periods_needing_attention().await
    }

    // =========================================================================
    // Lotes
    // =========================================================================

    pub async fn list_lotes(&self, filter: &LoteFilter) -> SyncResult<Vec<Lote>> {
        Ok(self.db.lotes().list(filter).await?)
    }

    pub async fn get_lote(&self, id: &str) -> SyncResult<LoteDetail> {
        let lote = self
            .db
            .lotes()
            .get_by_id(id)
            .await?
            .ok_or_else(|| SyncError::not_found("Lote", id))?;
        let documents = self.db.documents().status_breakdown_for_lote(id).await?;
        let generation_codes = self
            .db
            .documents()
            .list_for_lote(id)
            .await?
            .into_iter()
            .map(|d| d.generation_code)
            .collect();

        Ok(LoteDetail {
            lote,
            documents,
            generation_codes,
        })
    }

    /// Polls one lote on demand.
    pub async fn poll_lote(&self, id: &str) -> SyncResult<PollResult> {
        self.engine.poller.poll_lote(id).await
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    pub async fn list_events(&self, filter: &EventFilter) -> SyncResult<Vec<ContingencyEvent>> {
        Ok(self.db.events().list(filter).await?)
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    pub async fn reconcile(
        &self,
        scope: &Scope,
        range: &DateRange,
        options: ReconcileOptions,
    ) -> SyncResult<ReconciliationReport> {
        self.engine.reconciler.reconcile(scope, range, options).await
    }

    pub async fn reconcile_document(&self, generation_code: &str) -> SyncResult<ReconciliationRecord> {
        self.engine.reconciler.reconcile_document(generation_code).await
    }

    /// Runs [`AdminService::reconcile`] and writes the report as CSV.
    pub async fn reconcile_csv<W: Write>(
        &self,
        scope: &Scope,
        range: &DateRange,
        options: ReconcileOptions,
        writer: W,
    ) -> SyncResult<ReconciliationSummaryLine> {
        let report = self.reconcile(scope, range, options).await?;
        export_csv(&report, writer)?;
        Ok(ReconciliationSummaryLine {
            total: report.summary.total,
            discrepancies: report.summary.total - report.summary.matched,
        })
    }

    // =========================================================================
    // Documents
    // =========================================================================

    /// Looks a document up by id or generation code.
    pub async fn document_trace(&self, id_or_code: &str) -> SyncResult<DocumentTrace> {
        let documents = self.db.documents();
        let document = match documents.get_by_id(id_or_code).await? {
            Some(doc) => doc,
            None => documents
                .get_by_generation_code(id_or_code)
                .await?
                .ok_or_else(|| SyncError::not_found("Document", id_or_code))?,
        };

        let (period, event) = match document.contingency_period_id.as_deref() {
            Some(period_id) => (
                self.db.periods().get_by_id(period_id).await?,
                self.db.events().get_for_period(period_id).await?,
            ),
            None => (None, None),
        };
        let lote = match document.lote_id.as_deref() {
            Some(lote_id) => self.db.lotes().get_by_id(lote_id).await?,
            None => None,
        };

        Ok(DocumentTrace {
            document,
            period,
            event,
            lote,
        })
    }
}

/// Totals of a CSV export, for the caller's log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationSummaryLine {
    pub total: usize,
    pub discrepancies: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthorityMode, FiscalConfig};
    use crate::gateway::AuthorityError;
    use crate::simulated::SimulatedAuthority;
    use chrono::{NaiveDate, Utc};
    use fiscal_core::{DocumentKind, DocumentStatus, Environment, LoteStatus, NewDocument};
    use fiscal_db::DbConfig;

    fn scope() -> Scope {
        Scope::new("company-1", "M001", "P001", Environment::Test)
    }

    fn new_document(n: u32) -> NewDocument {
        NewDocument {
            generation_code: None,
            control_number: format!("DTE-01-M001P001-{:015}", n),
            kind: DocumentKind::Invoice,
            scope: scope(),
            issued_on: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            signed_payload: format!("signed-{}", n),
        }
    }

    async fn setup() -> (Arc<Database>, Arc<SimulatedAuthority>, AdminService) {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let authority = Arc::new(SimulatedAuthority::new());
        let mut config = FiscalConfig::default();
        config.authority.mode = AuthorityMode::Simulated;
        config.authority.issuer_nit = "06140101001010".into();
        config.retry.max_attempts = 1;
        config.retry.initial_interval_ms = 0;
        let engine = FiscalEngine::new(db.clone(), authority.clone(), &config).unwrap();
        (db.clone(), authority, AdminService::new(db, engine))
    }

    /// Finalizes `count` documents during an outage and returns the period id.
    async fn outage_period(admin: &AdminService, authority: &SimulatedAuthority, count: u32) -> String {
        authority.outage(AuthorityError::Connection("refused".into()));
        let mut period_id = String::new();
        for n in 1..=count {
            let outcome = admin.engine.pipeline.finalize(new_document(n)).await.unwrap();
            period_id = outcome.document().contingency_period_id.clone().unwrap();
        }
        authority.restore();
        period_id
    }

    #[tokio::test]
    async fn test_close_builds_lotes() {
        let (_, authority, admin) = setup().await;
        let period_id = outage_period(&admin, &authority, 3).await;

        let closed = admin.close_period(&period_id).await.unwrap();
        assert_eq!(closed.close.period.status, PeriodStatus::Closed);
        assert_eq!(closed.lotes.len(), 1);

        let detail = admin.get_period(&period_id).await.unwrap();
        assert!(detail.event.is_some());
        assert_eq!(detail.lotes.len(), 1);
        assert_eq!(detail.lotes[0].status, LoteStatus::Submitted);
        assert_eq!(detail.documents.iter().map(|c| c.count).sum::<i64>(), 3);
    }

    #[tokio::test]
    async fn test_lote_detail_and_trace() {
        let (_, authority, admin) = setup().await;
        let period_id = outage_period(&admin, &authority, 2).await;
        let closed = admin.close_period(&period_id).await.unwrap();
        let lote_id = closed.lotes[0].lote_id.clone();

        let polled = admin.poll_lote(&lote_id).await.unwrap();
        assert_eq!(polled.lote.status, LoteStatus::Completed);

        let detail = admin.get_lote(&lote_id).await.unwrap();
        assert_eq!(detail.generation_codes.len(), 2);
        assert_eq!(
            detail.documents,
            vec![StatusCount {
                status: DocumentStatus::Accepted,
                count: 2
            }]
        );

        let code = &detail.generation_codes[0];
        let trace = admin.document_trace(code).await.unwrap();
        assert_eq!(trace.document.status, DocumentStatus::Accepted);
        assert_eq!(trace.period.unwrap().id, period_id);
        assert_eq!(trace.lote.unwrap().id, lote_id);
        assert!(trace.event.is_some());

        let by_id = admin.document_trace(&trace.document.id).await.unwrap();
        assert_eq!(by_id.document.generation_code, *code);
    }

    #[tokio::test]
    async fn test_listings() {
        let (_, authority, admin) = setup().await;
        let period_id = outage_period(&admin, &authority, 1).await;

        let active = admin
            .list_periods(&PeriodFilter {
                status: Some(PeriodStatus::Active),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, period_id);

        admin.close_period(&period_id).await.unwrap();
        assert_eq!(admin.list_events(&EventFilter::default()).await.unwrap().len(), 1);
        assert_eq!(admin.list_lotes(&LoteFilter::default()).await.unwrap().len(), 1);
        assert!(admin.periods_needing_attention().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let (_, _, admin) = setup().await;
        assert!(matches!(admin.get_period("nope").await, Err(SyncError::NotFound { .. })));
        assert!(matches!(admin.get_lote("nope").await, Err(SyncError::NotFound { .. })));
        assert!(matches!(admin.document_trace("nope").await, Err(SyncError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_reconcile_csv() {
        let (_, _, admin) = setup().await;
        admin.engine.pipeline.finalize(new_document(1)).await.unwrap();
        let today = Utc::now().date_naive();
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            today.max(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()),
        );

        let mut out = Vec::new();
        let line = admin
            .reconcile_csv(&scope(), &range, ReconcileOptions { include_matches: true }, &mut out)
            .await
            .unwrap();
        assert_eq!(line, ReconciliationSummaryLine { total: 1, discrepancies: 0 });
        assert!(String::from_utf8(out).unwrap().contains("match"));
    }
}
