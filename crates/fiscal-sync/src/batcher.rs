//! # Lote Batcher
//!
//! Groups the backlog of a closed contingency period into lotes and submits
//! them to the authority's batch endpoint.
//!
//! ## Build
//! ```text
//! closed period
//!     │ unbatched contingency_pending documents (issue order)
//!     ▼
//! partition_into_lotes(max_batch_size)
//!     │ one transaction per lote: insert pending + attach documents
//!     ▼
//! submit_lote ── claim ──► submit_batch ──┬─► submitted (batch code)
//!                                         ├─► failed, documents released (rejection)
//!                                         └─► stays pending (unreachable / exhausted)
//! ```
//!
//! Building a period with nothing unbatched is a no-op, so the sweep can run
//! as often as it likes.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use fiscal_core::validation::{ensure_same_scope, partition_into_lotes, validate_batch_size};
use fiscal_core::{Lote, LoteStatus, PeriodStatus, RetryPolicy};
use fiscal_db::Database;

use crate::error::{SyncError, SyncResult};
use crate::gateway::{AuthorityGateway, BatchSubmission, DocumentSubmission};
use crate::retry::{call_with_retry, ignore_attempt};

/// What happened when a lote was offered to the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoteSubmission {
    Submitted { batch_code: String },
    /// Refused; the lote is failed and its documents are back in the backlog.
    Failed { reason: String, released: u64 },
    /// Left pending for the next sweep.
    Deferred { error: String },
    /// Claimed by another sweep.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoteReport {
    pub lote_id: String,
    pub document_count: i64,
    pub submission: LoteSubmission,
}

/// Counts from one batching sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSweep {
    pub built: usize,
    pub submitted: usize,
    pub failed: usize,
    pub deferred: usize,
}

impl BatchSweep {
    fn count(&mut self, report: &LoteReport) {
        match report.submission {
            LoteSubmission::Submitted { .. } => self.submitted += 1,
            LoteSubmission::Failed { .. } => self.failed += 1,
            LoteSubmission::Deferred { .. } => self.deferred += 1,
            LoteSubmission::Skipped => {}
        }
    }
}

#[derive(Clone)]
pub struct LoteBatcher {
    db: Arc<Database>,
    gateway: Arc<dyn AuthorityGateway>,
    policy: RetryPolicy,
    max_batch_size: usize,
    pending_limit: u32,
    claim_ttl: Duration,
}

impl LoteBatcher {
    /// ## Errors
    /// `max_batch_size` outside `1..=100`.
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn AuthorityGateway>,
        policy: RetryPolicy,
        max_batch_size: usize,
        claim_ttl: Duration,
    ) -> SyncResult<Self> {
        validate_batch_size(max_batch_size)?;
        Ok(LoteBatcher {
            db,
            gateway,
            policy,
            max_batch_size,
            pending_limit: 100,
            claim_ttl,
        })
    }

    /// Pending lotes picked up per sweep.
    pub fn with_pending_limit(mut self, limit: u32) -> Self {
        self.pending_limit = limit.max(1);
        self
    }

    /// Builds and submits lotes for a closed period's unbatched documents.
    pub async fn build(&self, period_id: &str) -> SyncResult<Vec<LoteReport>> {
        let period = self
            .db
            .periods()
            .get_by_id(period_id)
            .await?
            .ok_or_else(|| SyncError::not_found("ContingencyPeriod", period_id))?;

        if period.status != PeriodStatus::Closed {
            return Err(SyncError::invalid_transition(
                "ContingencyPeriod",
                period_id,
                "build lotes",
                period.status,
                "closed",
            ));
        }

        let backlog = self.db.documents().list_unbatched_for_period(period_id).await?;
        if backlog.is_empty() {
            debug!(period_id, "Nothing to batch");
            return Ok(Vec::new());
        }

        ensure_same_scope(&period.scope, &backlog)?;

        let ids: Vec<String> = backlog.into_iter().map(|d| d.id).collect();
        let total = ids.len();
        let chunks = partition_into_lotes(ids, self.max_batch_size)?;
        info!(period_id, documents = total, lotes = chunks.len(), "Batching contingency backlog");

        let lotes = self.db.lotes();
        let mut reports = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let lote = match lotes
                .create_with_documents(Some(period_id), &period.scope, &chunk, Utc::now())
                .await
            {
                Ok(lote) => lote,
                Err(e) if e.is_precondition_failed() => {
                    // Another builder got there first; it owns the rest too.
                    debug!(period_id, ?e, "Backlog batched concurrently, stopping");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            reports.push(self.submit_lote(&lote.id).await?);
        }

        Ok(reports)
    }

    /// Submits one pending lote under its sweep claim.
    pub async fn submit_lote(&self, lote_id: &str) -> SyncResult<LoteReport> {
        let lotes = self.db.lotes();
        let lote = lotes
            .get_by_id(lote_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Lote", lote_id))?;

        if lote.status != LoteStatus::Pending {
            return Err(SyncError::invalid_transition("Lote", lote_id, "submit", lote.status, "pending"));
        }

        if !lotes.claim(lote_id, Utc::now(), self.claim_ttl).await? {
            debug!(lote_id, "Lote claimed by another sweep");
            return Ok(LoteReport {
                lote_id: lote.id,
                document_count: lote.document_count,
                submission: LoteSubmission::Skipped,
            });
        }

        let result = self.submit_claimed(&lote).await;

        // Submitted and failed lotes are released by their own transition.
        if !matches!(
            result,
            Ok(LoteSubmission::Submitted { .. }) | Ok(LoteSubmission::Failed { .. })
        ) {
            if let Err(e) = lotes.release(lote_id).await {
                warn!(lote_id, ?e, "Failed to release lote claim");
            }
        }

        Ok(LoteReport {
            lote_id: lote.id,
            document_count: lote.document_count,
            submission: result?,
        })
    }

    async fn submit_claimed(&self, lote: &Lote) -> SyncResult<LoteSubmission> {
        let documents = self.db.documents().list_for_lote(&lote.id).await?;
        ensure_same_scope(&lote.scope, &documents)?;

        let batch = BatchSubmission {
            lote_id: lote.id.clone(),
            scope: lote.scope.clone(),
            documents: documents.iter().map(DocumentSubmission::from_submittable).collect(),
        };

        let result = call_with_retry(
            &self.policy,
            "submit_batch",
            || self.gateway.submit_batch(&batch),
            ignore_attempt,
        )
        .await;

        let lotes = self.db.lotes();
        let now = Utc::now();
        match result {
            Ok(receipt) => {
                lotes
                    .mark_submitted(&lote.id, &receipt.batch_code, receipt.raw_response.as_deref(), now)
                    .await?;
                Ok(LoteSubmission::Submitted {
                    batch_code: receipt.batch_code,
                })
            }
            Err(e) if e.is_rejection() => {
                let reason = e.to_string();
                let released = lotes
                    .mark_failed_and_release(&lote.id, &reason, e.raw_response(), now)
                    .await?;
                warn!(lote_id = %lote.id, %reason, released, "Lote rejected by authority");
                Ok(LoteSubmission::Failed { reason, released })
            }
            Err(e) => {
                warn!(lote_id = %lote.id, error = %e, "Lote not submitted, left pending");
                Ok(LoteSubmission::Deferred { error: e.to_string() })
            }
        }
    }

    /// Re-submits lotes left pending by an earlier sweep.
    pub async fn submit_pending(&self) -> SyncResult<Vec<LoteReport>> {
        let pending = self
            .db
            .lotes()
            .list_by_status(LoteStatus::Pending, self.pending_limit)
            .await?;

        let mut reports = Vec::with_capacity(pending.len());
        for lote in pending {
            match self.submit_lote(&lote.id).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(lote_id = %lote.id, ?e, "Pending lote submission failed"),
            }
        }
        Ok(reports)
    }

    /// The batching sweep: pending lotes first, then closed periods that still
    /// hold unbatched documents.
    pub async fn sweep(&self) -> SyncResult<BatchSweep> {
        let mut sweep = BatchSweep::default();

        for report in self.submit_pending().await? {
            sweep.count(&report);
        }

        for period in self.db.periods().closed_with_unbatched().await? {
            match self.build(&period.id).await {
                Ok(reports) => {
                    sweep.built += reports.len();
                    reports.iter().for_each(|r| sweep.count(r));
                }
                Err(e) => warn!(period_id = %period.id, ?e, "Failed to batch period"),
            }
        }

        if sweep != BatchSweep::default() {
            info!(?sweep, "Batch sweep finished");
        }
        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContingencySettings;
    use crate::contingency::ContingencyManager;
    use crate::gateway::AuthorityError;
    use crate::pipeline::SubmissionPipeline;
    use crate::simulated::{Operation, SimulatedAuthority};
    use chrono::NaiveDate;
    use fiscal_core::{DocumentKind, DocumentStatus, Environment, NewDocument, Scope};
    use fiscal_db::DbConfig;
    use std::collections::HashSet;

    fn scope() -> Scope {
        Scope::new("company-1", "M001", "P001", Environment::Test)
    }

    struct Fixture {
        db: Arc<Database>,
        authority: Arc<SimulatedAuthority>,
        batcher: LoteBatcher,
    }

    /// `count` documents in one closed period, none batched yet.
    async fn closed_period(count: u32, cap: usize) -> (Fixture, String) {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let authority = Arc::new(SimulatedAuthority::new());
        let policy = RetryPolicy::immediate(2);
        let manager = ContingencyManager::new(
            db.clone(),
            authority.clone(),
            policy,
            ContingencySettings::default(),
            "06140101001010",
        );
        let pipeline = SubmissionPipeline::new(db.clone(), authority.clone(), manager.clone(), policy);

        authority.outage(AuthorityError::Timeout(Duration::from_secs(60)));
        let mut period_id = String::new();
        for n in 0..count {
            let outcome = pipeline
                .finalize(NewDocument {
                    generation_code: None,
                    control_number: format!("DTE-01-M001P001-{:015}", n),
                    kind: DocumentKind::Invoice,
                    scope: scope(),
                    issued_on: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                    signed_payload: format!("signed-{}", n),
                })
                .await
                .unwrap();
            period_id = outcome.document().contingency_period_id.clone().unwrap();
        }
        authority.restore();
        manager.close_period(&period_id).await.unwrap();

        let batcher = LoteBatcher::new(db.clone(), authority.clone(), policy, cap, Duration::from_secs(300)).unwrap();
        (Fixture { db, authority, batcher }, period_id)
    }

    #[tokio::test]
    async fn test_build_partitions_backlog() {
        let (fx, period_id) = closed_period(5, 2).await;

        let reports = fx.batcher.build(&period_id).await.unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(
            reports.iter().map(|r| r.document_count).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        assert!(reports
            .iter()
            .all(|r| matches!(r.submission, LoteSubmission::Submitted { .. })));

        let mut seen = HashSet::new();
        for code in fx.authority.batch_codes() {
            for doc in fx.authority.batch_documents(&code) {
                assert!(seen.insert(doc), "document batched twice");
            }
        }
        assert_eq!(seen.len(), 5);

        // Nothing left: a second build is a no-op.
        assert!(fx.batcher.build(&period_id).await.unwrap().is_empty());
        assert_eq!(fx.authority.calls(Operation::SubmitBatch), 3);
    }

    #[tokio::test]
    async fn test_build_requires_closed_period() {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let authority = Arc::new(SimulatedAuthority::new());
        let cause = AuthorityError::Timeout(Duration::from_secs(1)).contingency_cause();
        let period = db.periods().insert_active(&scope(), &cause, Utc::now()).await.unwrap();
        let batcher = LoteBatcher::new(
            db.clone(),
            authority,
            RetryPolicy::immediate(1),
            100,
            Duration::from_secs(300),
        )
        .unwrap();

        let err = batcher.build(&period.id).await.unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[tokio::test]
    async fn test_rejected_lote_releases_documents() {
        let (fx, period_id) = closed_period(3, 100).await;
        fx.authority
            .fail_next(Operation::SubmitBatch, [AuthorityError::rejected("HTTP_400", "bad batch")]);

        let reports = fx.batcher.build(&period_id).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0].submission, LoteSubmission::Failed { released: 3, .. }));

        let lote = fx.db.lotes().get_by_id(&reports[0].lote_id).await.unwrap().unwrap();
        assert_eq!(lote.status, LoteStatus::Failed);
        assert!(!lote.processing);

        let backlog = fx.db.documents().list_unbatched_for_period(&period_id).await.unwrap();
        assert_eq!(backlog.len(), 3);
        assert!(backlog
            .iter()
            .all(|d| d.status == DocumentStatus::ContingencyPending && d.lote_id.is_none()));
    }

    #[tokio::test]
    async fn test_unreachable_lote_stays_pending() {
        let (fx, period_id) = closed_period(2, 100).await;
        fx.authority.outage(AuthorityError::Connection("refused".into()));

        let reports = fx.batcher.build(&period_id).await.unwrap();
        assert!(matches!(reports[0].submission, LoteSubmission::Deferred { .. }));
        let lote = fx.db.lotes().get_by_id(&reports[0].lote_id).await.unwrap().unwrap();
        assert_eq!(lote.status, LoteStatus::Pending);
        assert!(!lote.processing);

        fx.authority.restore();
        let sweep = fx.batcher.sweep().await.unwrap();
        assert_eq!(sweep.submitted, 1);
        assert_eq!(sweep.built, 0);

        let lote = fx.db.lotes().get_by_id(&reports[0].lote_id).await.unwrap().unwrap();
        assert_eq!(lote.status, LoteStatus::Submitted);
        assert!(lote.batch_code.is_some());
    }

    #[tokio::test]
    async fn test_pending_resubmission_is_limited_per_sweep() {
        let (fx, period_id) = closed_period(3, 1).await;
        fx.authority.outage(AuthorityError::Connection("refused".into()));
        assert_eq!(fx.batcher.build(&period_id).await.unwrap().len(), 3);
        fx.authority.restore();

        let batcher = fx.batcher.clone().with_pending_limit(2);
        assert_eq!(batcher.submit_pending().await.unwrap().len(), 2);
        assert_eq!(batcher.submit_pending().await.unwrap().len(), 1);
        assert!(batcher.submit_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claimed_lote_is_skipped() {
        let (fx, period_id) = closed_period(1, 100).await;
        fx.authority.outage(AuthorityError::Connection("refused".into()));
        let reports = fx.batcher.build(&period_id).await.unwrap();
        fx.authority.restore();

        let lote_id = &reports[0].lote_id;
        assert!(fx.db.lotes().claim(lote_id, Utc::now(), Duration::from_secs(300)).await.unwrap());

        let report = fx.batcher.submit_lote(lote_id).await.unwrap();
        assert_eq!(report.submission, LoteSubmission::Skipped);
    }

    #[tokio::test]
    async fn test_sweep_builds_closed_periods() {
        let (fx, _) = closed_period(4, 3).await;

        let sweep = fx.batcher.sweep().await.unwrap();
        assert_eq!(sweep.built, 2);
        assert_eq!(sweep.submitted, 2);
        assert!(fx.db.periods().closed_with_unbatched().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_size_is_bounded() {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let authority = Arc::new(SimulatedAuthority::new());
        let policy = RetryPolicy::immediate(1);
        let ttl = Duration::from_secs(300);

        assert!(LoteBatcher::new(db.clone(), authority.clone(), policy, 0, ttl).is_err());
        assert!(LoteBatcher::new(db.clone(), authority.clone(), policy, 101, ttl).is_err());
        assert!(LoteBatcher::new(db, authority, policy, 100, ttl).is_ok());
    }
}
