//! # Contingency Period Manager
//!
//! Opens, joins and closes contingency periods, and delivers the
//! notification that tells the authority a period happened.
//!
//! ## Period Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   assign(doc) ──► find_or_create_active(scope) ──► attach_to_period     │
//! │                         │                                │              │
//! │                         │   partial unique index         │ guarded on   │
//! │                         │   (one active per scope)       │ status=active│
//! │                         ▼                                ▼              │
//! │                    ┌─────────┐  close_period   ┌───────────┐            │
//! │                    │ active  │ ──────────────► │ reporting │            │
//! │                    └─────────┘                 └─────┬─────┘            │
//! │                                                      │ event RECIBIDO   │
//! │                                                      ▼                  │
//! │                                                ┌───────────┐            │
//! │                                                │  closed   │ ──► lotes  │
//! │                                                └───────────┘            │
//! │                                                                         │
//! │  A rejected or exhausted notification leaves the period in reporting   │
//! │  and lists it under `periods_needing_attention`.                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use fiscal_core::validation::validate_contingency_reason;
use fiscal_core::{
    new_generation_code, ContingencyCause, ContingencyEvent, ContingencyNotice, ContingencyPeriod,
    ContingencyType, CoreError, Document, DocumentStatus, EventStatus, PeriodStatus, RetryPolicy, Scope,
    MAX_CONTINGENCY_REASON_LEN, STATE_RECEIVED,
};
use fiscal_db::{Database, PeriodFilter};

use crate::config::ContingencySettings;
use crate::error::{SyncError, SyncResult};
use crate::gateway::{with_timeout, AuthorityGateway, ContingencyEventSubmission};
use crate::retry::call_with_retry;

// =============================================================================
// Event Signing
// =============================================================================

/// Signs the notification document before it is sent.
///
/// Documents reach this core already signed; the notification is the one
/// artifact the core produces itself, so signing is pluggable.
#[async_trait]
pub trait EventSigner: Send + Sync {
    async fn sign(&self, event_json: &str) -> SyncResult<String>;
}

/// Sends the notification as-is. For the simulated authority and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughSigner;

#[async_trait]
impl EventSigner for PassthroughSigner {
    async fn sign(&self, event_json: &str) -> SyncResult<String> {
        Ok(event_json.to_string())
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// What happened to a notification delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NotificationStatus {
    /// Received by the authority; the period is closed.
    Accepted,
    /// Refused; the period stays in reporting for an operator.
    Rejected { reason: String },
    /// Not delivered this time; the sweep will try again.
    Deferred { attempts: i64, error: String },
    /// Another sweep holds the period, or the event is no longer pending.
    Skipped,
}

/// Result of [`ContingencyManager::close_period`].
#[derive(Debug, Clone, Serialize)]
pub struct CloseOutcome {
    pub period: ContingencyPeriod,
    pub event: ContingencyEvent,
    pub notification: NotificationStatus,
}

/// Reason recorded for documents whose submission never reported back.
const INTERRUPTED_SUBMISSION_REASON: &str = "Submission interrupted before the authority answered";

/// Stranded documents moved to contingency per sweep.
const STRANDED_SWEEP_LIMIT: u32 = 100;

/// Counts from one notification sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NotificationSweep {
    /// Events created for periods whose close was interrupted.
    pub created: usize,
    /// Periods closed because their event was already accepted.
    pub healed: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub deferred: usize,
    pub skipped: usize,
}

impl NotificationSweep {
    fn count(&mut self, status: &NotificationStatus) {
        match status {
            NotificationStatus::Accepted => self.accepted += 1,
            NotificationStatus::Rejected { .. } => self.rejected += 1,
            NotificationStatus::Deferred { .. } => self.deferred += 1,
            NotificationStatus::Skipped => self.skipped += 1,
        }
    }
}

// =============================================================================
// Contingency Manager
// =============================================================================

/// Owns every contingency period transition.
#[derive(Clone)]
pub struct ContingencyManager {
    db: Arc<Database>,
    gateway: Arc<dyn AuthorityGateway>,
    signer: Arc<dyn EventSigner>,
    policy: RetryPolicy,
    settings: ContingencySettings,
    issuer_nit: String,
}

impl ContingencyManager {
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn AuthorityGateway>,
        policy: RetryPolicy,
        settings: ContingencySettings,
        issuer_nit: impl Into<String>,
    ) -> Self {
        ContingencyManager {
            db,
            gateway,
            signer: Arc::new(PassthroughSigner),
            policy,
            settings,
            issuer_nit: issuer_nit.into(),
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn EventSigner>) -> Self {
        self.signer = signer;
        self
    }

    pub fn settings(&self) -> &ContingencySettings {
        &self.settings
    }

    // =========================================================================
    // Assignment
    // =========================================================================

    /// Attaches a document to the scope's active period, opening one if the
    /// scope has none.
    ///
    /// Attaching only succeeds while the period is still active. If a close
    /// wins the race, the active period is resolved again (a fresh one is
    /// opened) up to `assign_attempts` times.
    pub async fn assign(
        &self,
        document: &Document,
        scope: &Scope,
        cause: &ContingencyCause,
    ) -> SyncResult<ContingencyPeriod> {
        if &document.scope != scope {
            return Err(CoreError::ScopeMismatch {
                generation_code: document.generation_code.clone(),
                expected: scope.to_string(),
                found: document.scope.to_string(),
            }
            .into());
        }

        let cause = bounded_cause(cause);
        validate_contingency_reason(cause.contingency_type, Some(&cause.reason))?;

        let periods = self.db.periods();
        let documents = self.db.documents();
        let attempts = self.settings.assign_attempts.max(1);

        for attempt in 1..=attempts {
            let now = Utc::now();
            let period = periods.find_or_create_active(scope, &cause, now).await?;

            if documents.attach_to_period(&document.id, &period.id, now).await? {
                info!(
                    document_id = %document.id,
                    generation_code = %document.generation_code,
                    period_id = %period.id,
                    contingency_type = period.contingency_type.code(),
                    "Document assigned to contingency period"
                );
                return Ok(period);
            }

            // The guard failed: find out whether the document moved on or the
            // period was closed under us.
            let current = documents
                .get_by_id(&document.id)
                .await?
                .ok_or_else(|| SyncError::not_found("Document", &document.id))?;

            if let Some(period_id) = current.contingency_period_id.as_deref() {
                debug!(document_id = %document.id, period_id, "Document already attached");
                return periods
                    .get_by_id(period_id)
                    .await?
                    .ok_or_else(|| SyncError::not_found("ContingencyPeriod", period_id));
            }

            if !matches!(
                current.status,
                DocumentStatus::Submitting | DocumentStatus::ContingencyPending
            ) {
                return Err(SyncError::invalid_transition(
                    "Document",
                    &document.id,
                    "assign",
                    current.status,
                    "submitting",
                ));
            }

            debug!(
                document_id = %document.id,
                period_id = %period.id,
                attempt,
                "Period left active before the document joined, re-resolving"
            );
        }

        warn!(document_id = %document.id, attempts, "Contingency assignment exhausted");
        Err(SyncError::AssignmentExhausted {
            document_id: document.id.clone(),
            attempts,
        })
    }

    // =========================================================================
    // Closing
    // =========================================================================

    /// `active → reporting`, then creates and delivers the notification.
    ///
    /// A notification that cannot be delivered now does not fail the close;
    /// the outcome says what happened and the sweep carries on from there.
    pub async fn close_period(&self, period_id: &str) -> SyncResult<CloseOutcome> {
        let periods = self.db.periods();
        let current = periods
            .get_by_id(period_id)
            .await?
            .ok_or_else(|| SyncError::not_found("ContingencyPeriod", period_id))?;
        if current.status != PeriodStatus::Active {
            return Err(SyncError::invalid_transition(
                "ContingencyPeriod",
                period_id,
                "close",
                current.status,
                "active",
            ));
        }

        let period = periods.begin_reporting(period_id, Utc::now()).await?;
        info!(period_id, scope = %period.scope, "Contingency period closed, reporting");

        let event = self.create_event(&period).await?;
        let notification = self.deliver(&event).await?;

        let period = periods
            .get_by_id(period_id)
            .await?
            .ok_or_else(|| SyncError::not_found("ContingencyPeriod", period_id))?;
        let event = self
            .db
            .events()
            .get_by_id(&event.id)
            .await?
            .ok_or_else(|| SyncError::not_found("ContingencyEvent", &event.id))?;

        Ok(CloseOutcome {
            period,
            event,
            notification,
        })
    }

    /// Closes active periods older than `max_age`.
    pub async fn close_expired_periods(&self, max_age: Duration) -> SyncResult<Vec<CloseOutcome>> {
        let age = chrono::Duration::from_std(max_age)
            .map_err(|e| SyncError::InvalidConfig(format!("max period age: {}", e)))?;
        let expired = self.db.periods().list_active_older_than(Utc::now() - age).await?;

        let outcomes = self.close_each(expired).await;
        if !outcomes.is_empty() {
            info!(closed = outcomes.len(), "Closed expired contingency periods");
        }
        Ok(outcomes)
    }

    /// Closes every active period once the authority accepts an
    /// authentication probe again.
    ///
    /// A failed probe is the expected answer during an outage and leaves the
    /// periods open.
    pub async fn close_recovered_periods(&self) -> SyncResult<Vec<CloseOutcome>> {
        let active = self
            .db
            .periods()
            .list(&PeriodFilter {
                status: Some(PeriodStatus::Active),
                ..Default::default()
            })
            .await?;
        if active.is_empty() {
            return Ok(Vec::new());
        }

        if let Err(e) = with_timeout(self.policy.attempt_timeout, self.gateway.authenticate()).await {
            debug!(active = active.len(), error = %e, "Authority still unreachable, periods stay open");
            return Ok(Vec::new());
        }

        let outcomes = self.close_each(active).await;
        if !outcomes.is_empty() {
            info!(closed = outcomes.len(), "Authority reachable again, closed contingency periods");
        }
        Ok(outcomes)
    }

    async fn close_each(&self, periods: Vec<ContingencyPeriod>) -> Vec<CloseOutcome> {
        let mut outcomes = Vec::with_capacity(periods.len());
        for period in periods {
            match self.close_period(&period.id).await {
                Ok(outcome) => outcomes.push(outcome),
                // Closed by someone else in between.
                Err(SyncError::InvalidTransition { .. }) => {
                    debug!(period_id = %period.id, "Period already closed");
                }
                Err(SyncError::Database(e)) if e.is_precondition_failed() => {
                    debug!(period_id = %period.id, "Period already closed");
                }
                Err(e) => warn!(period_id = %period.id, ?e, "Failed to close contingency period"),
            }
        }
        outcomes
    }

    // =========================================================================
    // Stranded Submissions
    // =========================================================================

    /// How long a document may stay `submitting` before its submission is
    /// presumed dead: every attempt timing out, the waits between them, and
    /// the configured margin.
    pub fn submission_lease(&self) -> Duration {
        let attempts = self.policy.max_attempts.max(1);
        self.policy.attempt_timeout * attempts
            + self.policy.max_interval.mul_f64(1.5) * (attempts - 1)
            + self.settings.submission_lease_margin()
    }

    /// Moves documents left in `submitting` for longer than `lease` into
    /// contingency. Returns how many were moved.
    ///
    /// These are submissions whose caller went away (cancelled, crashed, or
    /// failed to assign) before an outcome was recorded.
    pub async fn recover_stranded_submissions(&self, lease: Duration) -> SyncResult<usize> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| SyncError::InvalidConfig(format!("submission lease: {}", e)))?;
        let stranded = self
            .db
            .documents()
            .list_stranded_submitting(Utc::now() - lease, STRANDED_SWEEP_LIMIT)
            .await?;

        let cause = ContingencyCause::new(ContingencyType::AuthorityUnavailable, INTERRUPTED_SUBMISSION_REASON);
        let mut recovered = 0;
        for document in stranded {
            match self.assign(&document, &document.scope, &cause).await {
                Ok(period) => {
                    warn!(
                        document_id = %document.id,
                        generation_code = %document.generation_code,
                        period_id = %period.id,
                        "Stranded submission moved to contingency"
                    );
                    recovered += 1;
                }
                Err(e) => warn!(document_id = %document.id, ?e, "Failed to recover stranded submission"),
            }
        }
        Ok(recovered)
    }

    // =========================================================================
    // Notification
    // =========================================================================

    /// Builds and stores the unsigned notification for a reporting period.
    async fn create_event(&self, period: &ContingencyPeriod) -> SyncResult<ContingencyEvent> {
        let now = Utc::now();
        let codes = self.db.documents().period_codes(&period.id).await?;
        let generation_code = new_generation_code();
        let closed_at = period.closed_at.unwrap_or(now);

        let notice = ContingencyNotice::for_period(
            period,
            &generation_code,
            &self.issuer_nit,
            closed_at,
            now,
            &codes,
        );

        let event = ContingencyEvent {
            id: uuid::Uuid::new_v4().to_string(),
            period_id: period.id.clone(),
            generation_code,
            event_json: notice.to_json()?,
            signed_event: None,
            status: EventStatus::Pending,
            attempts: 0,
            authority_state: None,
            received_seal: None,
            authority_response: None,
            last_error: None,
            submitted_at: None,
            accepted_at: None,
            created_at: now,
        };

        let events = self.db.events();
        match events.insert(&event).await {
            Ok(()) => {
                debug!(period_id = %period.id, documents = codes.len(), "Contingency notification created");
                Ok(event)
            }
            Err(e) if e.is_unique_violation() => events
                .get_for_period(&period.id)
                .await?
                .ok_or_else(|| SyncError::not_found("ContingencyEvent", &period.id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Delivers one pending notification under the period's sweep claim.
    pub async fn deliver(&self, event: &ContingencyEvent) -> SyncResult<NotificationStatus> {
        if event.status != EventStatus::Pending {
            return Ok(NotificationStatus::Skipped);
        }

        let periods = self.db.periods();
        if !periods
            .claim(&event.period_id, Utc::now(), self.settings.claim_ttl())
            .await?
        {
            debug!(period_id = %event.period_id, "Period claimed by another sweep");
            return Ok(NotificationStatus::Skipped);
        }

        let result = self.deliver_claimed(event).await;

        if let Err(e) = periods.release(&event.period_id).await {
            warn!(period_id = %event.period_id, ?e, "Failed to release period claim");
        }
        result
    }

    async fn deliver_claimed(&self, event: &ContingencyEvent) -> SyncResult<NotificationStatus> {
        let events = self.db.events();
        let periods = self.db.periods();

        let period = periods
            .get_by_id(&event.period_id)
            .await?
            .ok_or_else(|| SyncError::not_found("ContingencyPeriod", &event.period_id))?;

        let signed_event = match &event.signed_event {
            Some(signed) => signed.clone(),
            None => {
                let signed = self.signer.sign(&event.event_json).await?;
                events.set_signed(&event.id, &signed).await?;
                signed
            }
        };

        let submission = ContingencyEventSubmission {
            generation_code: event.generation_code.clone(),
            environment: period.scope.environment,
            signed_event,
        };

        let result = call_with_retry(
            &self.policy,
            "submit_contingency_event",
            || self.gateway.submit_contingency_event(&submission),
            |attempt, error| {
                let events = events.clone();
                let event_id = event.id.clone();
                async move {
                    if let Err(e) = events
                        .record_attempt_failure(&event_id, &error.to_string(), error.raw_response(), Utc::now())
                        .await
                    {
                        warn!(event_id = %event_id, attempt, ?e, "Failed to record notification attempt");
                    }
                }
            },
        )
        .await;

        let now = Utc::now();
        match result {
            Ok(receipt) if receipt.state == STATE_RECEIVED => {
                events
                    .mark_accepted(
                        &event.id,
                        &receipt.state,
                        receipt.received_seal.as_deref(),
                        receipt.raw_response.as_deref(),
                        now,
                    )
                    .await?;
                periods.mark_closed(&event.period_id, now).await?;
                info!(
                    period_id = %event.period_id,
                    seal = receipt.received_seal.as_deref().unwrap_or(""),
                    "Contingency notification received by authority"
                );
                Ok(NotificationStatus::Accepted)
            }
            Ok(receipt) => {
                let reason = receipt
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("authority answered {}", receipt.state));
                events
                    .mark_rejected(
                        &event.id,
                        Some(&receipt.state),
                        receipt.raw_response.as_deref(),
                        &reason,
                        now,
                    )
                    .await?;
                warn!(period_id = %event.period_id, state = %receipt.state, %reason, "Contingency notification not received");
                Ok(NotificationStatus::Rejected { reason })
            }
            Err(e) if e.is_rejection() => {
                let reason = e.to_string();
                events
                    .mark_rejected(&event.id, None, e.raw_response(), &reason, now)
                    .await?;
                warn!(period_id = %event.period_id, %reason, "Contingency notification rejected");
                Ok(NotificationStatus::Rejected { reason })
            }
            Err(e) => {
                let error = e.to_string();
                let attempts = events
                    .record_attempt_failure(&event.id, &error, e.raw_response(), now)
                    .await?;
                if attempts >= i64::from(self.settings.max_notification_attempts) {
                    warn!(
                        period_id = %event.period_id,
                        attempts,
                        %error,
                        "Contingency notification attempts exhausted, period needs attention"
                    );
                } else {
                    debug!(period_id = %event.period_id, attempts, %error, "Contingency notification deferred");
                }
                Ok(NotificationStatus::Deferred { attempts, error })
            }
        }
    }

    /// The notification sweep.
    ///
    /// Creates events for periods whose close was interrupted, closes periods
    /// whose event was accepted without the period following, then retries
    /// every pending event still under the attempt cap.
    pub async fn retry_pending_notifications(&self) -> SyncResult<NotificationSweep> {
        let mut sweep = NotificationSweep::default();
        let periods = self.db.periods();
        let events = self.db.events();

        for period in periods.list_reporting_without_event().await? {
            match self.create_event(&period).await {
                Ok(_) => sweep.created += 1,
                Err(e) => warn!(period_id = %period.id, ?e, "Failed to create contingency notification"),
            }
        }

        let reporting = periods
            .list(&PeriodFilter {
                status: Some(PeriodStatus::Reporting),
                ..Default::default()
            })
            .await?;
        for period in reporting {
            if let Some(event) = events.get_for_period(&period.id).await? {
                if event.status == EventStatus::Accepted {
                    periods.mark_closed(&period.id, Utc::now()).await?;
                    sweep.healed += 1;
                }
            }
        }

        for event in events
            .list_pending_retryable(self.settings.max_notification_attempts)
            .await?
        {
            match self.deliver(&event).await {
                Ok(status) => sweep.count(&status),
                Err(e) => warn!(event_id = %event.id, ?e, "Contingency notification delivery failed"),
            }
        }

        if sweep != NotificationSweep::default() {
            info!(?sweep, "Notification sweep finished");
        }
        Ok(sweep)
    }

    /// Reporting periods whose notification was rejected or ran out of
    /// attempts.
    pub async fn periods_needing_attention(&self) -> SyncResult<Vec<ContingencyPeriod>> {
        Ok(self
            .db
            .periods()
            .list_reporting_needing_attention(self.settings.max_notification_attempts)
            .await?)
    }
}

/// Trims the reason and cuts it to what the authority accepts.
fn bounded_cause(cause: &ContingencyCause) -> ContingencyCause {
    let reason = cause.reason.trim();
    let reason = if reason.chars().count() > MAX_CONTINGENCY_REASON_LEN {
        reason.chars().take(MAX_CONTINGENCY_REASON_LEN).collect()
    } else {
        reason.to_string()
    };
    ContingencyCause::new(cause.contingency_type, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::AuthorityError;
    use crate::simulated::{Operation, SimulatedAuthority};
    use crate::worker::Sweep;
    use chrono::NaiveDate;
    use fiscal_core::{DocumentKind, Environment, NewDocument};
    use fiscal_db::DbConfig;

    fn scope() -> Scope {
        Scope::new("company-1", "M001", "P001", Environment::Test)
    }

    async fn setup() -> (Arc<Database>, Arc<SimulatedAuthority>, ContingencyManager) {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let authority = Arc::new(SimulatedAuthority::new());
        let manager = ContingencyManager::new(
            db.clone(),
            authority.clone(),
            RetryPolicy::immediate(2),
            ContingencySettings::default(),
            "06140101001010",
        );
        (db, authority, manager)
    }

    async fn submitting_document(db: &Database, n: u32) -> Document {
        let doc = Document::finalized(
            NewDocument {
                generation_code: None,
                control_number: format!("DTE-01-M001P001-{:015}", n),
                kind: DocumentKind::Invoice,
                scope: scope(),
                issued_on: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                signed_payload: format!("signed-{}", n),
            },
            Utc::now(),
        );
        db.documents().insert(&doc).await.unwrap();
        db.documents().mark_submitting(&doc.id, Utc::now()).await.unwrap();
        db.documents().get_by_id(&doc.id).await.unwrap().unwrap()
    }

    fn timeout_cause() -> ContingencyCause {
        AuthorityError::Timeout(Duration::from_secs(60)).contingency_cause()
    }

    #[tokio::test]
    async fn test_assign_reuses_active_period() {
        let (db, _, manager) = setup().await;
        let first = submitting_document(&db, 1).await;
        let second = submitting_document(&db, 2).await;

        let p1 = manager.assign(&first, &scope(), &timeout_cause()).await.unwrap();
        let p2 = manager.assign(&second, &scope(), &timeout_cause()).await.unwrap();

        assert_eq!(p1.id, p2.id);
        assert_eq!(p1.contingency_type, ContingencyType::AuthorityUnavailable);

        let stored = db.documents().get_by_id(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::ContingencyPending);
        assert_eq!(stored.contingency_period_id.as_deref(), Some(p1.id.as_str()));
    }

    #[tokio::test]
    async fn test_assign_rejects_foreign_scope() {
        let (db, _, manager) = setup().await;
        let doc = submitting_document(&db, 1).await;
        let other = Scope::new("company-1", "M002", "P001", Environment::Test);

        let err = manager.assign(&doc, &other, &timeout_cause()).await.unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[tokio::test]
    async fn test_late_assignment_opens_fresh_period() {
        let (db, _, manager) = setup().await;
        let early = submitting_document(&db, 1).await;
        let first = manager.assign(&early, &scope(), &timeout_cause()).await.unwrap();
        manager.close_period(&first.id).await.unwrap();

        let late = submitting_document(&db, 2).await;
        let second = manager.assign(&late, &scope(), &timeout_cause()).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(second.status, PeriodStatus::Active);
    }

    #[tokio::test]
    async fn test_close_delivers_notification() {
        let (db, authority, manager) = setup().await;
        let doc = submitting_document(&db, 1).await;
        let period = manager.assign(&doc, &scope(), &timeout_cause()).await.unwrap();

        let outcome = manager.close_period(&period.id).await.unwrap();

        assert_eq!(outcome.notification, NotificationStatus::Accepted);
        assert_eq!(outcome.period.status, PeriodStatus::Closed);
        assert!(outcome.period.closed_at.is_some());
        assert_eq!(outcome.event.status, EventStatus::Accepted);
        assert!(outcome.event.is_accepted());

        let sent = authority.received_events();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].signed_event.contains(&doc.generation_code));
    }

    #[tokio::test]
    async fn test_close_requires_active() {
        let (db, _, manager) = setup().await;
        let doc = submitting_document(&db, 1).await;
        let period = manager.assign(&doc, &scope(), &timeout_cause()).await.unwrap();
        manager.close_period(&period.id).await.unwrap();

        let err = manager.close_period(&period.id).await.unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[tokio::test]
    async fn test_unreachable_notification_is_deferred_then_swept() {
        let (db, authority, manager) = setup().await;
        let doc = submitting_document(&db, 1).await;
        let period = manager.assign(&doc, &scope(), &timeout_cause()).await.unwrap();

        authority.outage(AuthorityError::Connection("refused".into()));
        let outcome = manager.close_period(&period.id).await.unwrap();
        assert!(matches!(outcome.notification, NotificationStatus::Deferred { attempts: 1, .. }));
        assert_eq!(outcome.period.status, PeriodStatus::Reporting);

        authority.restore();
        let sweep = manager.retry_pending_notifications().await.unwrap();
        assert_eq!(sweep.accepted, 1);

        let period = db.periods().get_by_id(&period.id).await.unwrap().unwrap();
        assert_eq!(period.status, PeriodStatus::Closed);
    }

    #[tokio::test]
    async fn test_rejected_notification_needs_attention() {
        let (db, authority, manager) = setup().await;
        let doc = submitting_document(&db, 1).await;
        let period = manager.assign(&doc, &scope(), &timeout_cause()).await.unwrap();

        authority.fail_next(
            Operation::SubmitContingencyEvent,
            [AuthorityError::rejected("HTTP_400", "bad notice")],
        );
        let outcome = manager.close_period(&period.id).await.unwrap();
        assert!(matches!(outcome.notification, NotificationStatus::Rejected { .. }));
        assert_eq!(outcome.period.status, PeriodStatus::Reporting);

        let attention = manager.periods_needing_attention().await.unwrap();
        assert_eq!(attention.len(), 1);
        assert_eq!(attention[0].id, period.id);

        // Rejected events are never retried by the sweep.
        let sweep = manager.retry_pending_notifications().await.unwrap();
        assert_eq!(sweep.accepted, 0);
        assert_eq!(authority.calls(Operation::SubmitContingencyEvent), 1);
    }

    #[tokio::test]
    async fn test_close_expired_periods() {
        let (db, _, manager) = setup().await;
        let doc = submitting_document(&db, 1).await;
        manager.assign(&doc, &scope(), &timeout_cause()).await.unwrap();

        assert!(manager
            .close_expired_periods(Duration::from_secs(3600))
            .await
            .unwrap()
            .is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let closed = manager.close_expired_periods(Duration::from_millis(1)).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].period.status, PeriodStatus::Closed);
    }

    #[tokio::test]
    async fn test_recovered_authority_closes_active_periods() {
        let (db, authority, manager) = setup().await;
        let doc = submitting_document(&db, 1).await;
        let period = manager.assign(&doc, &scope(), &timeout_cause()).await.unwrap();

        authority.outage(AuthorityError::Connection("refused".into()));
        assert!(manager.close_recovered_periods().await.unwrap().is_empty());
        let still = db.periods().get_by_id(&period.id).await.unwrap().unwrap();
        assert_eq!(still.status, PeriodStatus::Active);

        authority.restore();
        let closed = manager.close_recovered_periods().await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].period.id, period.id);
        assert_eq!(closed[0].period.status, PeriodStatus::Closed);
        assert_eq!(authority.calls(Operation::Authenticate), 2);
    }

    #[tokio::test]
    async fn test_no_active_period_skips_the_probe() {
        let (_, authority, manager) = setup().await;
        assert!(manager.close_recovered_periods().await.unwrap().is_empty());
        assert_eq!(authority.calls(Operation::Authenticate), 0);
    }

    #[tokio::test]
    async fn test_stranded_submission_moves_to_contingency() {
        let (db, _, manager) = setup().await;
        let doc = submitting_document(&db, 1).await;

        assert_eq!(manager.recover_stranded_submissions(Duration::from_secs(3600)).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.recover_stranded_submissions(Duration::from_millis(1)).await.unwrap(), 1);

        let stored = db.documents().get_by_id(&doc.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::ContingencyPending);
        let period_id = stored.contingency_period_id.unwrap();
        let period = db.periods().get_by_id(&period_id).await.unwrap().unwrap();
        assert_eq!(period.contingency_type, ContingencyType::AuthorityUnavailable);

        // Nothing left to recover.
        assert_eq!(manager.recover_stranded_submissions(Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_submission_lease_covers_retry_budget() {
        let (_, _, manager) = setup().await;
        // Two attempts of 5s, no waits, 30s margin.
        assert_eq!(manager.submission_lease(), Duration::from_secs(40));
    }

    #[tokio::test]
    async fn test_sweep_recovers_then_closes() {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let authority = Arc::new(SimulatedAuthority::new());
        let settings = ContingencySettings {
            submission_lease_margin_secs: 0,
            ..Default::default()
        };
        let manager = ContingencyManager::new(
            db.clone(),
            authority.clone(),
            RetryPolicy::immediate(1).with_attempt_timeout(Duration::from_millis(10)),
            settings,
            "06140101001010",
        );
        let doc = submitting_document(&db, 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let summary = Sweep::sweep(&manager).await.unwrap();
        assert_eq!(summary.progressed, 1);

        let stored = db.documents().get_by_id(&doc.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::ContingencyPending);
        let period = db
            .periods()
            .get_by_id(stored.contingency_period_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(period.status, PeriodStatus::Closed);
    }

    #[test]
    fn test_bounded_cause() {
        let long = "x".repeat(MAX_CONTINGENCY_REASON_LEN + 20);
        let cause = bounded_cause(&ContingencyCause::new(ContingencyType::Other, format!("  {}  ", long)));
        assert_eq!(cause.reason.chars().count(), MAX_CONTINGENCY_REASON_LEN);
    }
}
