//! # Lote Poller
//!
//! Follows submitted lotes until the authority has ruled on every document.
//!
//! ```text
//! submitted / processing ── query_batch_status ──┬─ processing ──► processing, last_polled_at
//!                                                ├─ results ─────► verdicts applied;
//!                                                │                 completed once all are in
//!                                                ├─ unknown ─────► failed, documents released
//!                                                └─ error ───────► unchanged
//! ```
//!
//! Lotes processing longer than the configured maximum are flagged stale and
//! logged; staleness is never a failure. Every state change after the query
//! is one transaction, so an interrupted poll leaves the lote as it was.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use fiscal_core::{DocumentStatus, Lote, LoteStatus};
use fiscal_db::Database;

use crate::config::PollingSettings;
use crate::error::{SyncError, SyncResult};
use crate::gateway::{with_timeout, AuthorityGateway, BatchState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    /// The lote was already completed; nothing was asked.
    AlreadyCompleted,
    StillProcessing { stale: bool },
    /// Some verdicts arrived; the lote keeps processing.
    PartiallyApplied { applied: usize, remaining: i64 },
    Completed { applied: usize },
    /// The authority does not know the batch code.
    Unknown { released: u64 },
    /// The query failed; the lote is unchanged.
    QueryFailed { error: String },
    /// Claimed by another sweep.
    Skipped,
}

/// Where one document of a lote stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentOutcome {
    pub generation_code: String,
    pub status: DocumentStatus,
    pub received_seal: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollResult {
    pub lote: Lote,
    pub outcome: PollOutcome,
    pub documents: Vec<DocumentOutcome>,
}

/// Counts from one polling sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollSweep {
    pub polled: usize,
    pub completed: usize,
    pub processing: usize,
    pub failed: usize,
    pub query_failed: usize,
    pub stale: usize,
}

#[derive(Clone)]
pub struct LotePoller {
    db: Arc<Database>,
    gateway: Arc<dyn AuthorityGateway>,
    attempt_timeout: Duration,
    max_processing: Duration,
    limit: u32,
    claim_ttl: Duration,
}

impl LotePoller {
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn AuthorityGateway>,
        settings: &PollingSettings,
        attempt_timeout: Duration,
        claim_ttl: Duration,
    ) -> Self {
        LotePoller {
            db,
            gateway,
            attempt_timeout,
            max_processing: settings.max_processing(),
            limit: settings.limit.max(1),
            claim_ttl,
        }
    }

    /// Polls one lote. On a completed lote this returns the stored outcomes
    /// without asking the authority.
    pub async fn poll_lote(&self, lote_id: &str) -> SyncResult<PollResult> {
        let lotes = self.db.lotes();
        let lote = lotes
            .get_by_id(lote_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Lote", lote_id))?;

        match lote.status {
            LoteStatus::Completed => return self.result(lote, PollOutcome::AlreadyCompleted).await,
            LoteStatus::Submitted | LoteStatus::Processing => {}
            other => {
                return Err(SyncError::invalid_transition(
                    "Lote",
                    lote_id,
                    "poll",
                    other,
                    "submitted or processing",
                ))
            }
        }

        let batch_code = lote
            .batch_code
            .clone()
            .ok_or_else(|| SyncError::Internal(format!("lote {} was submitted without a batch code", lote_id)))?;

        if !lotes.claim(lote_id, Utc::now(), self.claim_ttl).await? {
            debug!(lote_id, "Lote claimed by another sweep");
            return self.result(lote, PollOutcome::Skipped).await;
        }

        let outcome = self.poll_claimed(&lote, &batch_code).await;

        if let Err(e) = lotes.release(lote_id).await {
            warn!(lote_id, ?e, "Failed to release lote claim");
        }

        let outcome = outcome?;
        let lote = lotes
            .get_by_id(lote_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Lote", lote_id))?;
        self.result(lote, outcome).await
    }

    async fn poll_claimed(&self, lote: &Lote, batch_code: &str) -> SyncResult<PollOutcome> {
        let report = match with_timeout(self.attempt_timeout, self.gateway.query_batch_status(batch_code)).await {
            Ok(report) => report,
            Err(e) => {
                warn!(lote_id = %lote.id, batch_code, error = %e, "Batch status query failed, lote unchanged");
                return Ok(PollOutcome::QueryFailed { error: e.to_string() });
            }
        };

        let lotes = self.db.lotes();
        let now = Utc::now();
        let stale = match (lote.submitted_at, chrono::Duration::from_std(self.max_processing).ok()) {
            (Some(submitted_at), Some(limit)) => now - submitted_at > limit,
            _ => false,
        };
        if stale && !lote.stale {
            warn!(
                lote_id = %lote.id,
                batch_code,
                max_processing_secs = self.max_processing.as_secs(),
                "Lote still processing past the maximum duration"
            );
        }

        let raw = report.raw_response.as_deref();
        match report.state {
            BatchState::Processing => {
                lotes.mark_polled(&lote.id, stale, raw, now).await?;
                Ok(PollOutcome::StillProcessing {
                    stale: stale || lote.stale,
                })
            }
            BatchState::Results(verdicts) => {
                let applied = lotes.apply_results(&lote.id, &verdicts, stale, raw, now).await?;
                if applied.status == LoteStatus::Completed {
                    info!(lote_id = %lote.id, applied = applied.applied, "Lote completed");
                    Ok(PollOutcome::Completed {
                        applied: applied.applied,
                    })
                } else {
                    debug!(
                        lote_id = %lote.id,
                        applied = applied.applied,
                        remaining = applied.remaining,
                        "Partial lote results applied"
                    );
                    Ok(PollOutcome::PartiallyApplied {
                        applied: applied.applied,
                        remaining: applied.remaining,
                    })
                }
            }
            BatchState::Unknown => {
                let released = lotes
                    .mark_failed_and_release(&lote.id, "batch code unknown to the authority", raw, now)
                    .await?;
                warn!(lote_id = %lote.id, batch_code, released, "Authority does not know the batch, lote failed");
                Ok(PollOutcome::Unknown { released })
            }
        }
    }

    async fn result(&self, lote: Lote, outcome: PollOutcome) -> SyncResult<PollResult> {
        let documents = self
            .db
            .documents()
            .list_for_lote(&lote.id)
            .await?
            .into_iter()
            .map(|d| DocumentOutcome {
                generation_code: d.generation_code,
                status: d.status,
                received_seal: d.authority.received_seal,
            })
            .collect();

        Ok(PollResult {
            lote,
            outcome,
            documents,
        })
    }

    /// One polling sweep over outstanding lotes.
    pub async fn poll_once(&self) -> SyncResult<PollSweep> {
        let mut sweep = PollSweep::default();

        for lote in self.db.lotes().list_outstanding(self.limit).await? {
            let result = match self.poll_lote(&lote.id).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(lote_id = %lote.id, ?e, "Lote poll failed");
                    continue;
                }
            };

            match result.outcome {
                PollOutcome::Skipped => continue,
                PollOutcome::Completed { .. } | PollOutcome::AlreadyCompleted => sweep.completed += 1,
                PollOutcome::StillProcessing { .. } | PollOutcome::PartiallyApplied { .. } => {
                    sweep.processing += 1
                }
                PollOutcome::Unknown { .. } => sweep.failed += 1,
                PollOutcome::QueryFailed { .. } => sweep.query_failed += 1,
            }
            sweep.polled += 1;
            if result.lote.stale {
                sweep.stale += 1;
            }
        }

        if sweep.polled > 0 {
            info!(?sweep, "Poll sweep finished");
        }
        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{AuthorityError, BatchSubmission, DocumentSubmission};
    use crate::simulated::{Operation, SimulatedAuthority};
    use chrono::NaiveDate;
    use fiscal_core::{
        ContingencyType, ContingencyCause, Document, DocumentKind, Environment, NewDocument, Scope,
    };
    use fiscal_db::DbConfig;

    fn scope() -> Scope {
        Scope::new("company-1", "M001", "P001", Environment::Test)
    }

    struct Fixture {
        db: Arc<Database>,
        authority: Arc<SimulatedAuthority>,
        poller: LotePoller,
    }

    async fn fixture(max_processing_secs: u64) -> Fixture {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let authority = Arc::new(SimulatedAuthority::new());
        let settings = PollingSettings {
            max_processing_secs,
            ..Default::default()
        };
        let poller = LotePoller::new(
            db.clone(),
            authority.clone(),
            &settings,
            Duration::from_secs(5),
            Duration::from_secs(300),
        );
        Fixture { db, authority, poller }
    }

    /// A submitted lote of `count` documents numbered from `first`.
    async fn submitted_lote(fx: &Fixture, first: u32, count: u32) -> (Lote, Vec<Document>) {
        let now = Utc::now();
        let cause = ContingencyCause::new(ContingencyType::AuthorityUnavailable, "timeout");
        let period = fx.db.periods().find_or_create_active(&scope(), &cause, now).await.unwrap();

        let documents = fx.db.documents();
        let mut ids = Vec::new();
        for n in first..first + count {
            let doc = Document::finalized(
                NewDocument {
                    generation_code: None,
                    control_number: format!("DTE-01-M001P001-{:015}", n),
                    kind: DocumentKind::Invoice,
                    scope: scope(),
                    issued_on: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                    signed_payload: format!("signed-{}", n),
                },
                now,
            );
            documents.insert(&doc).await.unwrap();
            documents.mark_submitting(&doc.id, now).await.unwrap();
            assert!(documents.attach_to_period(&doc.id, &period.id, now).await.unwrap());
            ids.push(doc.id);
        }

        let lote = fx
            .db
            .lotes()
            .create_with_documents(Some(&period.id), &scope(), &ids, now)
            .await
            .unwrap();
        let docs = documents.list_for_lote(&lote.id).await.unwrap();

        let batch = BatchSubmission {
            lote_id: lote.id.clone(),
            scope: scope(),
            documents: docs.iter().map(DocumentSubmission::from_submittable).collect(),
        };
        let receipt = fx.authority.submit_batch(&batch).await.unwrap();
        fx.db
            .lotes()
            .mark_submitted(&lote.id, &receipt.batch_code, None, now)
            .await
            .unwrap();

        let lote = fx.db.lotes().get_by_id(&lote.id).await.unwrap().unwrap();
        (lote, docs)
    }

    #[tokio::test]
    async fn test_results_complete_the_lote() {
        let fx = fixture(3600).await;
        let (lote, docs) = submitted_lote(&fx, 0, 3).await;

        let result = fx.poller.poll_lote(&lote.id).await.unwrap();
        assert_eq!(result.outcome, PollOutcome::Completed { applied: 3 });
        assert_eq!(result.lote.status, LoteStatus::Completed);
        assert_eq!(result.documents.len(), docs.len());
        assert!(result
            .documents
            .iter()
            .all(|d| d.status == DocumentStatus::Accepted && d.received_seal.is_some()));
    }

    #[tokio::test]
    async fn test_completed_lote_poll_is_idempotent() {
        let fx = fixture(3600).await;
        let (lote, _) = submitted_lote(&fx, 0, 2).await;

        let first = fx.poller.poll_lote(&lote.id).await.unwrap();
        let second = fx.poller.poll_lote(&lote.id).await.unwrap();

        assert_eq!(second.outcome, PollOutcome::AlreadyCompleted);
        assert_eq!(first.documents, second.documents);
        assert_eq!(fx.authority.calls(Operation::QueryBatchStatus), 1);
    }

    #[tokio::test]
    async fn test_processing_then_partial_then_complete() {
        let fx = fixture(3600).await;
        fx.authority.batch_polls(1);
        fx.authority.partial_results(1);
        let (lote, _) = submitted_lote(&fx, 0, 3).await;

        let first = fx.poller.poll_lote(&lote.id).await.unwrap();
        assert_eq!(first.outcome, PollOutcome::StillProcessing { stale: false });
        assert_eq!(first.lote.status, LoteStatus::Processing);
        assert!(first.lote.last_polled_at.is_some());

        let second = fx.poller.poll_lote(&lote.id).await.unwrap();
        assert_eq!(second.outcome, PollOutcome::PartiallyApplied { applied: 1, remaining: 2 });
        assert_eq!(second.lote.status, LoteStatus::Processing);

        let third = fx.poller.poll_lote(&lote.id).await.unwrap();
        assert_eq!(third.outcome, PollOutcome::Completed { applied: 2 });
        assert_eq!(third.lote.status, LoteStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_batch_fails_lote_and_releases_documents() {
        let fx = fixture(3600).await;
        let (lote, docs) = submitted_lote(&fx, 0, 2).await;
        fx.authority.forget_batch(lote.batch_code.as_deref().unwrap());

        let result = fx.poller.poll_lote(&lote.id).await.unwrap();
        assert_eq!(result.outcome, PollOutcome::Unknown { released: 2 });
        assert_eq!(result.lote.status, LoteStatus::Failed);

        for doc in docs {
            let stored = fx.db.documents().get_by_id(&doc.id).await.unwrap().unwrap();
            assert_eq!(stored.status, DocumentStatus::ContingencyPending);
            assert!(stored.lote_id.is_none());
        }
    }

    #[tokio::test]
    async fn test_query_error_leaves_lote_unchanged() {
        let fx = fixture(3600).await;
        let (lote, _) = submitted_lote(&fx, 0, 1).await;
        fx.authority
            .fail_next(Operation::QueryBatchStatus, [AuthorityError::Server { status: 500, body: String::new() }]);

        let result = fx.poller.poll_lote(&lote.id).await.unwrap();
        assert!(matches!(result.outcome, PollOutcome::QueryFailed { .. }));
        assert_eq!(result.lote.status, LoteStatus::Submitted);
        assert!(!result.lote.processing);
        assert!(result.lote.last_polled_at.is_none());
    }

    #[tokio::test]
    async fn test_stale_lote_is_flagged_not_failed() {
        let fx = fixture(0).await;
        fx.authority.batch_polls(5);
        let (lote, _) = submitted_lote(&fx, 0, 1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = fx.poller.poll_lote(&lote.id).await.unwrap();
        assert_eq!(result.outcome, PollOutcome::StillProcessing { stale: true });
        assert!(result.lote.stale);
        assert_eq!(result.lote.status, LoteStatus::Processing);
    }

    #[tokio::test]
    async fn test_pending_lote_cannot_be_polled() {
        let fx = fixture(3600).await;
        let cause = ContingencyCause::new(ContingencyType::AuthorityUnavailable, "timeout");
        let period = fx.db.periods().insert_active(&scope(), &cause, Utc::now()).await.unwrap();
        let lote = fx
            .db
            .lotes()
            .create_with_documents(Some(&period.id), &scope(), &[], Utc::now())
            .await
            .unwrap();

        let err = fx.poller.poll_lote(&lote.id).await.unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[tokio::test]
    async fn test_poll_once_sweeps_outstanding() {
        let fx = fixture(3600).await;
        submitted_lote(&fx, 0, 1).await;
        submitted_lote(&fx, 1, 1).await;

        let sweep = fx.poller.poll_once().await.unwrap();
        assert_eq!(sweep.polled, 2);
        assert_eq!(sweep.completed, 2);

        assert_eq!(fx.poller.poll_once().await.unwrap(), PollSweep::default());
    }
}
