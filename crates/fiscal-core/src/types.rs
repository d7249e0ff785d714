//! # Domain Types
//!
//! Core domain types shared by every layer.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Scope (company, establishment, point of sale, environment)            │
//! │    │                                                                    │
//! │    ├── Document ───────────┐  contingency_period_id?  lote_id?        │
//! │    │     kind: DocumentKind│                                           │
//! │    │     status            │                                           │
//! │    │                       ▼                                           │
//! │    ├── ContingencyPeriod ◄─┘  at most one Active per scope             │
//! │    │     └── ContingencyEvent (its notification to the authority)     │
//! │    │                                                                    │
//! │    └── Lote  (documents of one scope, submitted as one batch)          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! Every persisted record has an `id` (UUID v4 string) used for relations.
//! Documents also carry a `generation_code`, the identifier the authority
//! knows them by, assigned at signing time and never changed.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::{STATE_PROCESSED, STATE_RECEIVED, STATE_REJECTED};

// =============================================================================
// Environment
// =============================================================================

/// Authority environment a document is issued against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Authority test environment (wire code `00`).
    Test,
    /// Authority production environment (wire code `01`).
    Production,
}

impl Environment {
    /// Two-digit code the authority expects in the `ambiente` field.
    pub fn code(&self) -> &'static str {
        match self {
            Environment::Test => "00",
            Environment::Production => "01",
        }
    }

    /// Parses the authority's two-digit code.
    pub fn from_code(code: &str) -> CoreResult<Self> {
        match code {
            "00" => Ok(Environment::Test),
            "01" => Ok(Environment::Production),
            other => Err(CoreError::unknown_code("environment", other)),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Production => write!(f, "production"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "test" | "00" => Ok(Environment::Test),
            "production" | "prod" | "01" => Ok(Environment::Production),
            other => Err(CoreError::unknown_code("environment", other)),
        }
    }
}

// =============================================================================
// Scope
// =============================================================================

/// The unit contingency is tracked in.
///
/// Two documents share a scope when they come from the same company,
/// establishment and point of sale and target the same environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub company_id: String,
    pub establishment_id: String,
    pub point_of_sale_id: String,
    pub environment: Environment,
}

impl Scope {
    pub fn new(
        company_id: impl Into<String>,
        establishment_id: impl Into<String>,
        point_of_sale_id: impl Into<String>,
        environment: Environment,
    ) -> Self {
        Scope {
            company_id: company_id.into(),
            establishment_id: establishment_id.into(),
            point_of_sale_id: point_of_sale_id.into(),
            environment,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.company_id, self.establishment_id, self.point_of_sale_id, self.environment
        )
    }
}

// =============================================================================
// Document Kind
// =============================================================================

/// The fiscal document variants this core submits.
///
/// The core never branches on kind beyond these accessors: every variant
/// is submitted, batched and reconciled the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// Consumer invoice (`01`).
    Invoice,
    /// Tax credit invoice (`03`).
    CreditFiscalInvoice,
    /// Remission note (`04`).
    RemissionNote,
    /// Credit note (`05`).
    CreditNote,
    /// Debit note (`06`).
    DebitNote,
    /// Purchase receipt from a non-registered supplier (`14`).
    PurchaseReceipt,
}

impl DocumentKind {
    /// Authority catalogue code (`tipoDte`).
    pub fn code(&self) -> &'static str {
        match self {
            DocumentKind::Invoice => "01",
            DocumentKind::CreditFiscalInvoice => "03",
            DocumentKind::RemissionNote => "04",
            DocumentKind::CreditNote => "05",
            DocumentKind::DebitNote => "06",
            DocumentKind::PurchaseReceipt => "14",
        }
    }

    pub fn from_code(code: &str) -> CoreResult<Self> {
        match code {
            "01" => Ok(DocumentKind::Invoice),
            "03" => Ok(DocumentKind::CreditFiscalInvoice),
            "04" => Ok(DocumentKind::RemissionNote),
            "05" => Ok(DocumentKind::CreditNote),
            "06" => Ok(DocumentKind::DebitNote),
            "14" => Ok(DocumentKind::PurchaseReceipt),
            other => Err(CoreError::unknown_code("document kind", other)),
        }
    }

    /// Envelope version the reception endpoint expects for this kind.
    pub fn wire_version(&self) -> u32 {
        match self {
            DocumentKind::CreditFiscalInvoice => 3,
            _ => 1,
        }
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

// =============================================================================
// Document Status
// =============================================================================

/// Lifecycle of a document with respect to the authority.
///
/// ```text
/// draft ─► finalized ─► submitting ─┬─► accepted
///                                   ├─► rejected
///                                   └─► contingency_pending ─► accepted | rejected
///                                          ▲          (via lote poll)
///                                          └── released from a failed lote
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Draft,
    Finalized,
    Submitting,
    Accepted,
    Rejected,
    ContingencyPending,
}

impl DocumentStatus {
    /// Accepted and rejected are final: nothing in this core moves a
    /// document out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Accepted | DocumentStatus::Rejected)
    }

    /// Returns true if the state machine allows `self -> next`.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Draft, Finalized)
                | (Finalized, Submitting)
                | (Submitting, Accepted)
                | (Submitting, Rejected)
                | (Submitting, ContingencyPending)
                | (ContingencyPending, Accepted)
                | (ContingencyPending, Rejected)
                | (ContingencyPending, ContingencyPending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Draft => "draft",
            DocumentStatus::Finalized => "finalized",
            DocumentStatus::Submitting => "submitting",
            DocumentStatus::Accepted => "accepted",
            DocumentStatus::Rejected => "rejected",
            DocumentStatus::ContingencyPending => "contingency_pending",
        }
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocumentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(DocumentStatus::Draft),
            "finalized" => Ok(DocumentStatus::Finalized),
            "submitting" => Ok(DocumentStatus::Submitting),
            "accepted" => Ok(DocumentStatus::Accepted),
            "rejected" => Ok(DocumentStatus::Rejected),
            "contingency_pending" | "contingency-pending" => Ok(DocumentStatus::ContingencyPending),
            other => Err(CoreError::unknown_code("document status", other)),
        }
    }
}

// =============================================================================
// Authority Fields
// =============================================================================

/// What the authority said about a document, once it said anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityFields {
    /// Raw authority state (`PROCESADO`, `RECHAZADO`, ...).
    pub state: Option<String>,
    /// Proof-of-receipt seal, present on acceptance.
    pub received_seal: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub message_code: Option<String>,
    pub message_description: Option<String>,
    #[serde(default)]
    pub observations: Vec<String>,
}

/// A definitive per-document answer from the authority, from either the
/// direct reception endpoint or a batch status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityVerdict {
    pub generation_code: String,
    pub accepted: bool,
    pub fields: AuthorityFields,
}

impl AuthorityVerdict {
    /// Builds a verdict from a raw authority state string.
    pub fn from_state(generation_code: impl Into<String>, fields: AuthorityFields) -> Self {
        let accepted = fields.state.as_deref() == Some(STATE_PROCESSED);
        AuthorityVerdict {
            generation_code: generation_code.into(),
            accepted,
            fields,
        }
    }

    /// The document status this verdict leads to.
    pub fn status(&self) -> DocumentStatus {
        if self.accepted {
            DocumentStatus::Accepted
        } else {
            DocumentStatus::Rejected
        }
    }
}

// =============================================================================
// Document
// =============================================================================

/// A fiscal document as tracked by this core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Authority-facing identifier (uppercase UUID), immutable.
    pub generation_code: String,
    /// Sequential per-scope control number.
    pub control_number: String,
    pub kind: DocumentKind,
    pub scope: Scope,
    pub issued_on: NaiveDate,
    /// Opaque signed artifact produced upstream.
    pub signed_payload: String,
    pub status: DocumentStatus,
    /// Direct submission attempts that ended in a transient error.
    pub submission_attempts: i64,
    pub contingency_period_id: Option<String>,
    pub lote_id: Option<String>,
    pub authority: AuthorityFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for a new document entering the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDocument {
    /// Defaults to a fresh uppercase UUID when absent.
    pub generation_code: Option<String>,
    pub control_number: String,
    pub kind: DocumentKind,
    pub scope: Scope,
    pub issued_on: NaiveDate,
    pub signed_payload: String,
}

impl Document {
    /// Builds a finalized document ready for submission.
    pub fn finalized(input: NewDocument, now: DateTime<Utc>) -> Self {
        Document {
            id: uuid::Uuid::new_v4().to_string(),
            generation_code: input
                .generation_code
                .map(|c| c.to_uppercase())
                .unwrap_or_else(new_generation_code),
            control_number: input.control_number,
            kind: input.kind,
            scope: input.scope,
            issued_on: input.issued_on,
            signed_payload: input.signed_payload,
            status: DocumentStatus::Finalized,
            submission_attempts: 0,
            contingency_period_id: None,
            lote_id: None,
            authority: AuthorityFields::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// The capabilities the submission path needs from any document kind.
pub trait Submittable {
    fn generation_code(&self) -> &str;
    fn kind(&self) -> DocumentKind;
    fn scope(&self) -> &Scope;
    fn status(&self) -> DocumentStatus;
    fn signed_payload(&self) -> &str;
}

impl Submittable for Document {
    fn generation_code(&self) -> &str {
        &self.generation_code
    }

    fn kind(&self) -> DocumentKind {
        self.kind
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn status(&self) -> DocumentStatus {
        self.status
    }

    fn signed_payload(&self) -> &str {
        &self.signed_payload
    }
}

/// Generates an authority-style generation code (uppercase UUID v4).
pub fn new_generation_code() -> String {
    uuid::Uuid::new_v4().to_string().to_uppercase()
}

// =============================================================================
// Contingency Period
// =============================================================================

/// Lifecycle of a contingency period.
///
/// ```text
/// active ──close──► reporting ──notification accepted──► closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum PeriodStatus {
    Active,
    Reporting,
    Closed,
}

impl PeriodStatus {
    pub fn can_transition_to(&self, next: PeriodStatus) -> bool {
        matches!(
            (self, next),
            (PeriodStatus::Active, PeriodStatus::Reporting)
                | (PeriodStatus::Reporting, PeriodStatus::Closed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodStatus::Active => "active",
            PeriodStatus::Reporting => "reporting",
            PeriodStatus::Closed => "closed",
        }
    }
}

impl std::fmt::Display for PeriodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PeriodStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(PeriodStatus::Active),
            "reporting" => Ok(PeriodStatus::Reporting),
            "closed" => Ok(PeriodStatus::Closed),
            other => Err(CoreError::unknown_code("period status", other)),
        }
    }
}

/// Authority catalogue of contingency causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum ContingencyType {
    /// The authority's reception system is not available.
    AuthorityUnavailable = 1,
    /// The issuer's own system is not available.
    IssuerSystemFailure = 2,
    /// Internet connectivity failure on the issuer side.
    InternetOutage = 3,
    /// Power outage on the issuer side.
    PowerOutage = 4,
    /// Anything else; requires a free-text reason.
    Other = 5,
}

impl ContingencyType {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> CoreResult<Self> {
        match code {
            1 => Ok(ContingencyType::AuthorityUnavailable),
            2 => Ok(ContingencyType::IssuerSystemFailure),
            3 => Ok(ContingencyType::InternetOutage),
            4 => Ok(ContingencyType::PowerOutage),
            5 => Ok(ContingencyType::Other),
            other => Err(CoreError::unknown_code("contingency type", other.to_string())),
        }
    }

    pub fn requires_reason(&self) -> bool {
        matches!(self, ContingencyType::Other)
    }

    pub fn description(&self) -> &'static str {
        match self {
            ContingencyType::AuthorityUnavailable => "Authority reception system unavailable",
            ContingencyType::IssuerSystemFailure => "Issuer system unavailable",
            ContingencyType::InternetOutage => "Internet service failure",
            ContingencyType::PowerOutage => "Power supply failure",
            ContingencyType::Other => "Other cause",
        }
    }
}

/// Why a document fell back to contingency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContingencyCause {
    pub contingency_type: ContingencyType,
    pub reason: String,
}

impl ContingencyCause {
    pub fn new(contingency_type: ContingencyType, reason: impl Into<String>) -> Self {
        ContingencyCause {
            contingency_type,
            reason: reason.into(),
        }
    }
}

/// A time-bounded contingency window for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContingencyPeriod {
    pub id: String,
    pub scope: Scope,
    pub status: PeriodStatus,
    pub contingency_type: ContingencyType,
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Set while a sweep holds the period.
    pub processing: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Contingency Event
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Accepted,
    Rejected,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventStatus::Pending => write!(f, "pending"),
            EventStatus::Accepted => write!(f, "accepted"),
            EventStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(EventStatus::Pending),
            "accepted" => Ok(EventStatus::Accepted),
            "rejected" => Ok(EventStatus::Rejected),
            other => Err(CoreError::unknown_code("event status", other)),
        }
    }
}

/// A period's notification of its own contingency to the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContingencyEvent {
    pub id: String,
    pub period_id: String,
    pub generation_code: String,
    /// Unsigned notification document, as JSON.
    pub event_json: String,
    pub signed_event: Option<String>,
    pub status: EventStatus,
    pub attempts: i64,
    pub authority_state: Option<String>,
    pub received_seal: Option<String>,
    pub authority_response: Option<String>,
    pub last_error: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ContingencyEvent {
    /// The authority acknowledges notifications with `RECIBIDO`.
    pub fn is_accepted(&self) -> bool {
        self.authority_state.as_deref() == Some(STATE_RECEIVED)
    }
}

// =============================================================================
// Lote
// =============================================================================

/// Lifecycle of a lote.
///
/// ```text
/// pending ─► submitted ─► processing ─► completed
///    │           │             │
///    └───────────┴─────────────┴──────► failed (documents released)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum LoteStatus {
    Pending,
    Submitted,
    Processing,
    Completed,
    Failed,
}

impl LoteStatus {
    /// Lotes the poller still has to follow up on.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, LoteStatus::Submitted | LoteStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoteStatus::Completed | LoteStatus::Failed)
    }

    pub fn can_transition_to(&self, next: LoteStatus) -> bool {
        use LoteStatus::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Pending, Failed)
                | (Submitted, Processing)
                | (Submitted, Completed)
                | (Submitted, Failed)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoteStatus::Pending => "pending",
            LoteStatus::Submitted => "submitted",
            LoteStatus::Processing => "processing",
            LoteStatus::Completed => "completed",
            LoteStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoteStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(LoteStatus::Pending),
            "submitted" => Ok(LoteStatus::Submitted),
            "processing" => Ok(LoteStatus::Processing),
            "completed" => Ok(LoteStatus::Completed),
            "failed" => Ok(LoteStatus::Failed),
            other => Err(CoreError::unknown_code("lote status", other)),
        }
    }
}

/// A batch of same-scope documents submitted together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lote {
    pub id: String,
    pub period_id: Option<String>,
    pub scope: Scope,
    pub status: LoteStatus,
    /// Batch code assigned by the authority on acceptance.
    pub batch_code: Option<String>,
    pub document_count: i64,
    /// Still processing past the configured maximum duration.
    pub stale: bool,
    pub processing: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub authority_response: Option<String>,
    pub failure_reason: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Date Range
// =============================================================================

/// Inclusive range of issue dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        DateRange { from, to }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.from && date <= self.to
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
