//! # Authority Gateway
//!
//! The single seam between this engine and the tax authority. Everything
//! above it (pipeline, manager, batcher, poller, reconciliation) only sees
//! this trait and its error taxonomy.
//!
//! ## Failure Taxonomy
//! ```text
//! ┌──────────────────────────┬─────────────────────────┬──────────────────────────┐
//! │ AuthorityError           │ FailureClass            │ Handling                 │
//! ├──────────────────────────┼─────────────────────────┼──────────────────────────┤
//! │ Timeout                  │ Unavailable             │ contingency immediately  │
//! │ Connection               │ Unavailable             │ contingency immediately  │
//! │ Unavailable (503)        │ Unavailable             │ contingency immediately  │
//! │ Auth                     │ Unavailable             │ contingency immediately  │
//! │ Server (5xx)             │ Transient               │ backoff, then escalate   │
//! │ RateLimited (429)        │ Transient               │ backoff, then escalate   │
//! │ Malformed                │ Transient               │ backoff, then escalate   │
//! │ Rejected (4xx)           │ Rejection               │ terminal, surfaced       │
//! └──────────────────────────┴─────────────────────────┴──────────────────────────┘
//! ```
//!
//! A definitive per-document answer (`PROCESADO` / `RECHAZADO`) is not an
//! error: it comes back as an [`AuthorityVerdict`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use fiscal_core::{
    AuthorityVerdict, ContingencyCause, ContingencyType, DateRange, DocumentKind, Environment,
    RemoteDocumentStatus, Scope, Submittable,
};

// =============================================================================
// Errors
// =============================================================================

/// How the engine reacts to an authority failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Worth retrying with backoff; escalates when the budget runs out.
    Transient,
    /// The authority cannot be reached at all; retrying now is pointless.
    Unavailable,
    /// A definitive refusal; never retried automatically.
    Rejection,
}

/// Errors returned by an [`AuthorityGateway`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorityError {
    /// No answer within the per-attempt bound.
    #[error("Authority did not answer within {}s", .0.as_secs())]
    Timeout(Duration),

    /// The connection could not be established (DNS, refused, reset).
    #[error("Connection to authority failed: {0}")]
    Connection(String),

    /// The authority explicitly reports its reception system as down.
    #[error("Authority reception system unavailable: {0}")]
    Unavailable(String),

    /// Credentials were refused or the token endpoint failed.
    #[error("Authority authentication failed: {0}")]
    Auth(String),

    /// 5xx other than an explicit outage.
    #[error("Authority server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },

    /// 429.
    #[error("Authority rate limited the request")]
    RateLimited,

    /// The response could not be understood.
    #[error("Malformed authority response: {0}")]
    Malformed(String),

    /// The authority refused the request itself (4xx, batch rejected,
    /// notification not received).
    #[error("Authority rejected the request ({code}): {message}")]
    Rejected {
        code: String,
        message: String,
        raw_response: Option<String>,
    },
}

impl AuthorityError {
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        AuthorityError::Rejected {
            code: code.into(),
            message: message.into(),
            raw_response: None,
        }
    }

    pub fn failure_class(&self) -> FailureClass {
        match self {
            AuthorityError::Timeout(_)
            | AuthorityError::Connection(_)
            | AuthorityError::Unavailable(_)
            | AuthorityError::Auth(_) => FailureClass::Unavailable,
            AuthorityError::Server { .. } | AuthorityError::RateLimited | AuthorityError::Malformed(_) => {
                FailureClass::Transient
            }
            AuthorityError::Rejected { .. } => FailureClass::Rejection,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.failure_class() == FailureClass::Transient
    }

    pub fn is_unavailable(&self) -> bool {
        self.failure_class() == FailureClass::Unavailable
    }

    pub fn is_rejection(&self) -> bool {
        self.failure_class() == FailureClass::Rejection
    }

    /// The contingency cause this failure justifies when it ends a
    /// submission attempt.
    ///
    /// ```text
    /// timeout, outage, auth, exhausted 5xx  → 1 (authority unavailable)
    /// connection refused / unreachable     → 3 (internet outage)
    /// anything else                        → 5 (other), with the error text
    /// ```
    pub fn contingency_cause(&self) -> ContingencyCause {
        match self {
            AuthorityError::Timeout(_)
            | AuthorityError::Unavailable(_)
            | AuthorityError::Auth(_)
            | AuthorityError::Server { .. } => {
                ContingencyCause::new(ContingencyType::AuthorityUnavailable, self.to_string())
            }
            AuthorityError::Connection(_) => {
                ContingencyCause::new(ContingencyType::InternetOutage, self.to_string())
            }
            AuthorityError::RateLimited | AuthorityError::Malformed(_) | AuthorityError::Rejected { .. } => {
                ContingencyCause::new(ContingencyType::Other, self.to_string())
            }
        }
    }

    /// Raw response body, when the failure carried one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            AuthorityError::Rejected { raw_response, .. } => raw_response.as_deref(),
            AuthorityError::Server { body, .. } => Some(body.as_str()),
            _ => None,
        }
    }
}

pub type AuthorityResult<T> = Result<T, AuthorityError>;

// =============================================================================
// Requests / Responses
// =============================================================================

/// Bearer credential with its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// One document as the reception endpoints need it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSubmission {
    pub generation_code: String,
    pub kind: DocumentKind,
    pub environment: Environment,
    pub signed_payload: String,
}

impl DocumentSubmission {
    pub fn from_submittable<D: Submittable + ?Sized>(doc: &D) -> Self {
        DocumentSubmission {
            generation_code: doc.generation_code().to_string(),
            kind: doc.kind(),
            environment: doc.scope().environment,
            signed_payload: doc.signed_payload().to_string(),
        }
    }
}

/// A lote as sent to the batch endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSubmission {
    pub lote_id: String,
    pub scope: Scope,
    pub documents: Vec<DocumentSubmission>,
}

/// The authority accepted a batch for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReceipt {
    pub batch_code: String,
    pub raw_response: Option<String>,
}

/// Where a submitted batch stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchState {
    /// Accepted but no per-document results yet.
    Processing,
    /// Per-document verdicts. May cover only part of the batch.
    Results(Vec<AuthorityVerdict>),
    /// The authority does not know this batch code.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStatusReport {
    pub state: BatchState,
    pub raw_response: Option<String>,
}

impl BatchStatusReport {
    pub fn new(state: BatchState) -> Self {
        BatchStatusReport {
            state,
            raw_response: None,
        }
    }
}

/// Lookup key for a single-document status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentQuery {
    pub generation_code: String,
    pub kind: DocumentKind,
    pub environment: Environment,
}

/// Contingency notification to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContingencyEventSubmission {
    pub generation_code: String,
    pub environment: Environment,
    pub signed_event: String,
}

/// The authority's answer to a contingency notification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventReceipt {
    /// `RECIBIDO` when accepted.
    pub state: String,
    pub received_seal: Option<String>,
    pub message: Option<String>,
    pub observations: Vec<String>,
    pub raw_response: Option<String>,
}

// =============================================================================
// Trait
// =============================================================================

/// Everything the engine asks of the tax authority.
///
/// Implementations must not retry on their own; retry budgets are applied by
/// the callers from [`fiscal_core::RetryPolicy`], and every call is wrapped in
/// a per-attempt timeout.
#[async_trait]
pub trait AuthorityGateway: Send + Sync {
    /// Obtains a bearer credential.
    async fn authenticate(&self) -> AuthorityResult<Credential>;

    /// Direct single-document submission.
    async fn submit_document(&self, document: &DocumentSubmission) -> AuthorityResult<AuthorityVerdict>;

    /// Submits a batch. A refused batch is `Err(Rejected)`.
    async fn submit_batch(&self, batch: &BatchSubmission) -> AuthorityResult<BatchReceipt>;

    /// Queries a previously accepted batch.
    async fn query_batch_status(&self, batch_code: &str) -> AuthorityResult<BatchStatusReport>;

    /// `Ok(None)` when the authority has no record of the document.
    async fn query_document_status(&self, query: &DocumentQuery) -> AuthorityResult<Option<RemoteDocumentStatus>>;

    /// Delivers a signed contingency notification.
    async fn submit_contingency_event(&self, event: &ContingencyEventSubmission) -> AuthorityResult<EventReceipt>;

    /// Lists what the authority holds for a scope and range. `Ok(None)` when
    /// the authority offers no listing, which disables `missing_locally`
    /// detection.
    async fn list_documents(
        &self,
        _scope: &Scope,
        _range: &DateRange,
    ) -> AuthorityResult<Option<Vec<RemoteDocumentStatus>>> {
        Ok(None)
    }
}

/// Runs one gateway call under a per-attempt timeout; exceeding it is
/// [`AuthorityError::Timeout`].
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> AuthorityResult<T>
where
    F: std::future::Future<Output = AuthorityResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AuthorityError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classes() {
        assert_eq!(
            AuthorityError::Timeout(Duration::from_secs(60)).failure_class(),
            FailureClass::Unavailable
        );
        assert!(AuthorityError::Connection("refused".into()).is_unavailable());
        assert!(AuthorityError::Unavailable("503".into()).is_unavailable());
        assert!(AuthorityError::Server { status: 500, body: String::new() }.is_transient());
        assert!(AuthorityError::RateLimited.is_transient());
        assert!(AuthorityError::Malformed("eof".into()).is_transient());
        assert!(AuthorityError::rejected("HTTP_400", "bad").is_rejection());
    }

    #[test]
    fn test_contingency_causes() {
        let timeout = AuthorityError::Timeout(Duration::from_secs(5)).contingency_cause();
        assert_eq!(timeout.contingency_type, ContingencyType::AuthorityUnavailable);

        let refused = AuthorityError::Connection("connection refused".into()).contingency_cause();
        assert_eq!(refused.contingency_type, ContingencyType::InternetOutage);

        let exhausted = AuthorityError::Server { status: 502, body: "bad gateway".into() }.contingency_cause();
        assert_eq!(exhausted.contingency_type, ContingencyType::AuthorityUnavailable);

        let other = AuthorityError::Malformed("unexpected token".into()).contingency_cause();
        assert_eq!(other.contingency_type, ContingencyType::Other);
        assert!(other.reason.contains("unexpected token"));
    }

    #[tokio::test]
    async fn test_timeout_wrapper() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, AuthorityError>(1)
        };
        let err = with_timeout(Duration::from_millis(10), slow).await.unwrap_err();
        assert_eq!(err, AuthorityError::Timeout(Duration::from_millis(10)));

        let fast = async { Ok::<_, AuthorityError>(2) };
        assert_eq!(with_timeout(Duration::from_secs(1), fast).await.unwrap(), 2);
    }
}
