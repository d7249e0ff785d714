//! # Submission Pipeline
//!
//! Direct submission of a single document, with contingency as the fallback.
//!
//! ## Submission Flow
//! ```text
//! finalize(input)
//!     │ insert (finalized)
//!     ▼
//! submit(id) ── mark_submitting ──► submit_document (per-attempt timeout)
//!                                        │
//!         ┌──────────────────────────────┼───────────────────────────────┐
//!         ▼                              ▼                               ▼
//!   PROCESADO / RECHAZADO         transient (5xx, 429,            unreachable (timeout,
//!   record verdict (terminal)     malformed): backoff retry,      connection, outage):
//!                                 counter += 1; exhausted ──────► ContingencyManager::assign
//!                                                                 (contingency_pending)
//! ```
//!
//! Authority downtime never fails a finalize call: the document lands in
//! contingency and the call returns normally.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use fiscal_core::validation::validate_document;
use fiscal_core::{
    AuthorityFields, AuthorityVerdict, ContingencyCause, ContingencyPeriod, Document, DocumentStatus,
    NewDocument, RetryPolicy, STATE_REJECTED,
};
use fiscal_db::Database;

use crate::contingency::ContingencyManager;
use crate::error::{SyncError, SyncResult};
use crate::gateway::{AuthorityError, AuthorityGateway, DocumentSubmission};
use crate::retry::call_with_retry;

/// How a submission ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// Processed by the authority; the document carries its seal.
    Accepted(Document),
    /// Definitively refused by the authority.
    Rejected(Document),
    /// The authority could not be reached; the document waits in a period.
    Contingency {
        document: Document,
        period: ContingencyPeriod,
        cause: ContingencyCause,
    },
}

impl SubmissionOutcome {
    pub fn document(&self) -> &Document {
        match self {
            SubmissionOutcome::Accepted(doc) | SubmissionOutcome::Rejected(doc) => doc,
            SubmissionOutcome::Contingency { document, .. } => document,
        }
    }

    pub fn is_contingency(&self) -> bool {
        matches!(self, SubmissionOutcome::Contingency { .. })
    }
}

/// Stateless per call; clones share the pool and gateway.
#[derive(Clone)]
pub struct SubmissionPipeline {
    db: Arc<Database>,
    gateway: Arc<dyn AuthorityGateway>,
    contingency: ContingencyManager,
    policy: RetryPolicy,
}

impl SubmissionPipeline {
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn AuthorityGateway>,
        contingency: ContingencyManager,
        policy: RetryPolicy,
    ) -> Self {
        SubmissionPipeline {
            db,
            gateway,
            contingency,
            policy,
        }
    }

    /// Persists a new finalized document, then submits it.
    pub async fn finalize(&self, input: NewDocument) -> SyncResult<SubmissionOutcome> {
        let document = Document::finalized(input, Utc::now());
        validate_document(&document)?;
        self.db.documents().insert(&document).await?;

        info!(
            document_id = %document.id,
            generation_code = %document.generation_code,
            kind = %document.kind.code(),
            scope = %document.scope,
            "Document finalized"
        );

        self.submit(&document.id).await
    }

    /// Submits a stored document. Drafts are finalized first; any status
    /// past `finalized` is refused.
    pub async fn submit(&self, document_id: &str) -> SyncResult<SubmissionOutcome> {
        let documents = self.db.documents();
        let mut document = documents
            .get_by_id(document_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Document", document_id))?;

        if document.status == DocumentStatus::Draft {
            documents.mark_finalized(document_id, Utc::now()).await?;
            document.status = DocumentStatus::Finalized;
        }

        if document.status != DocumentStatus::Finalized {
            return Err(SyncError::invalid_transition(
                "Document",
                document_id,
                "submit",
                document.status,
                "finalized",
            ));
        }

        documents.mark_submitting(document_id, Utc::now()).await?;
        document.status = DocumentStatus::Submitting;

        let submission = DocumentSubmission::from_submittable(&document);
        let result = call_with_retry(
            &self.policy,
            "submit_document",
            || self.gateway.submit_document(&submission),
            |attempt, error| {
                let documents = documents.clone();
                let id = document.id.clone();
                async move {
                    match documents.increment_attempts(&id, Utc::now()).await {
                        Ok(count) => debug!(document_id = %id, attempt, count, %error, "Submission retry counted"),
                        Err(e) => warn!(document_id = %id, ?e, "Failed to count submission retry"),
                    }
                }
            },
        )
        .await;

        match result {
            Ok(verdict) => self.record(&document, &verdict).await,
            Err(e) if e.is_rejection() => {
                let verdict = rejection_verdict(&document, &e);
                self.record(&document, &verdict).await
            }
            Err(e) => self.fall_back(document, e).await,
        }
    }

    /// Stamps a definitive verdict. Terminal.
    async fn record(&self, document: &Document, verdict: &AuthorityVerdict) -> SyncResult<SubmissionOutcome> {
        let documents = self.db.documents();
        if !documents.record_verdict(&document.id, verdict, Utc::now()).await? {
            warn!(document_id = %document.id, "Document already had a verdict, keeping the stored one");
        }

        let stored = documents
            .get_by_id(&document.id)
            .await?
            .ok_or_else(|| SyncError::not_found("Document", &document.id))?;

        if stored.status == DocumentStatus::Accepted {
            info!(
                document_id = %stored.id,
                seal = stored.authority.received_seal.as_deref().unwrap_or(""),
                "Document accepted by authority"
            );
            Ok(SubmissionOutcome::Accepted(stored))
        } else {
            warn!(
                document_id = %stored.id,
                code = stored.authority.message_code.as_deref().unwrap_or(""),
                message = stored.authority.message_description.as_deref().unwrap_or(""),
                "Document rejected by authority"
            );
            Ok(SubmissionOutcome::Rejected(stored))
        }
    }

    /// Hands an undeliverable document to the contingency manager.
    async fn fall_back(&self, document: Document, error: AuthorityError) -> SyncResult<SubmissionOutcome> {
        let documents = self.db.documents();
        if error.is_transient() {
            // The last failed attempt of an exhausted budget.
            documents.increment_attempts(&document.id, Utc::now()).await?;
        }

        let cause = error.contingency_cause();
        warn!(
            document_id = %document.id,
            error = %error,
            contingency_type = cause.contingency_type.code(),
            "Authority unreachable, document goes to contingency"
        );

        let period = self.contingency.assign(&document, &document.scope, &cause).await?;
        let stored = documents
            .get_by_id(&document.id)
            .await?
            .ok_or_else(|| SyncError::not_found("Document", &document.id))?;

        Ok(SubmissionOutcome::Contingency {
            document: stored,
            period,
            cause,
        })
    }
}

/// A 4xx refusal turned into a stored rejection.
fn rejection_verdict(document: &Document, error: &AuthorityError) -> AuthorityVerdict {
    let (code, message) = match error {
        AuthorityError::Rejected { code, message, .. } => (code.clone(), message.clone()),
        other => (String::from("REJECTED"), other.to_string()),
    };
    AuthorityVerdict {
        generation_code: document.generation_code.clone(),
        accepted: false,
        fields: AuthorityFields {
            state: Some(STATE_REJECTED.to_string()),
            received_seal: None,
            processed_at: Some(Utc::now()),
            message_code: Some(code),
            message_description: Some(message),
            observations: Vec::new(),
        },
    }
}
