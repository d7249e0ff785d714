//! # Reconciliation Comparison
//!
//! Pure comparison of a local document against what the authority reports
//! for the same generation code. The engine that fetches remote state lives
//! in fiscal-sync; everything it decides is decided here.
//!
//! ## Classification
//! ```text
//! ┌──────────────────────┬──────────────────────────────────────────────────┐
//! │ match                │ local and remote agree on state (and seal)       │
//! │ status_mismatch      │ state or seal differ: local record is stale      │
//! │ missing_remotely     │ authority has no record of a local document      │
//! │ missing_locally      │ authority lists a document we do not have        │
//! │ query_failed         │ the authority could not be asked                 │
//! └──────────────────────┴──────────────────────────────────────────────────┘
//! ```
//!
//! Date drift (issue date, processing timestamp) is reported as a
//! discrepancy and counted separately, without changing the classification.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{Document, DocumentKind, DocumentStatus};
use crate::{STATE_PROCESSED, STATE_REJECTED};

/// Authority date format for issue dates.
pub const AUTHORITY_DATE_FORMAT: &str = "%d/%m/%Y";

/// Authority timestamp format for processing times (UTC).
pub const AUTHORITY_TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Match,
    StatusMismatch,
    MissingRemotely,
    MissingLocally,
    QueryFailed,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Match => "match",
            Classification::StatusMismatch => "status_mismatch",
            Classification::MissingRemotely => "missing_remotely",
            Classification::MissingLocally => "missing_locally",
            Classification::QueryFailed => "query_failed",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the authority query itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Success,
    NotFound,
    Error,
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryStatus::Success => write!(f, "success"),
            QueryStatus::NotFound => write!(f, "not_found"),
            QueryStatus::Error => write!(f, "error"),
        }
    }
}

/// What the authority returns for a single document status query.
///
/// Dates are kept in the authority's own text formats; they are parsed only
/// when compared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDocumentStatus {
    pub generation_code: String,
    pub state: String,
    pub received_seal: Option<String>,
    /// `dd/MM/yyyy HH:mm:ss`
    pub processed_at: Option<String>,
    /// `dd/MM/yyyy`
    pub issued_on: Option<String>,
    pub message_code: Option<String>,
    pub message_description: Option<String>,
    #[serde(default)]
    pub observations: Vec<String>,
}

/// One row of a reconciliation report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub generation_code: String,
    pub document_id: Option<String>,
    pub control_number: Option<String>,
    pub kind: Option<DocumentKind>,
    pub issued_on: Option<NaiveDate>,

    pub local_status: Option<DocumentStatus>,
    pub local_seal: Option<String>,
    pub local_processed_at: Option<DateTime<Utc>>,

    pub remote_state: Option<String>,
    pub remote_seal: Option<String>,
    pub remote_processed_at: Option<String>,
    pub remote_issued_on: Option<String>,
    pub remote_message_code: Option<String>,
    pub remote_message_description: Option<String>,
    #[serde(default)]
    pub remote_observations: Vec<String>,

    pub classification: Classification,
    pub date_matches: bool,
    #[serde(default)]
    pub discrepancies: Vec<String>,
    pub query_status: QueryStatus,
    pub error_message: Option<String>,
    pub queried_at: DateTime<Utc>,
}

impl ReconciliationRecord {
    fn local(doc: &Document, classification: Classification, query_status: QueryStatus, at: DateTime<Utc>) -> Self {
        ReconciliationRecord {
            generation_code: doc.generation_code.clone(),
            document_id: Some(doc.id.clone()),
            control_number: Some(doc.control_number.clone()),
            kind: Some(doc.kind),
            issued_on: Some(doc.issued_on),
            local_status: Some(doc.status),
            local_seal: doc.authority.received_seal.clone(),
            local_processed_at: doc.authority.processed_at,
            remote_state: None,
            remote_seal: None,
            remote_processed_at: None,
            remote_issued_on: None,
            remote_message_code: None,
            remote_message_description: None,
            remote_observations: Vec::new(),
            classification,
            date_matches: true,
            discrepancies: Vec::new(),
            query_status,
            error_message: None,
            queried_at: at,
        }
    }

    fn with_remote(mut self, remote: &RemoteDocumentStatus) -> Self {
        self.remote_state = Some(remote.state.clone());
        self.remote_seal = remote.received_seal.clone();
        self.remote_processed_at = remote.processed_at.clone();
        self.remote_issued_on = remote.issued_on.clone();
        self.remote_message_code = remote.message_code.clone();
        self.remote_message_description = remote.message_description.clone();
        self.remote_observations = remote.observations.clone();
        self
    }

    pub fn is_match(&self) -> bool {
        self.classification == Classification::Match
    }
}

/// Counts by classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub total: usize,
    pub matched: usize,
    pub status_mismatched: usize,
    pub missing_remotely: usize,
    pub missing_locally: usize,
    pub query_failed: usize,
    pub date_mismatches: usize,
}

impl ReconciliationSummary {
    pub fn tally<'a>(records: impl IntoIterator<Item = &'a ReconciliationRecord>) -> Self {
        let mut summary = ReconciliationSummary::default();
        for record in records {
            summary.add(record);
        }
        summary
    }

    pub fn add(&mut self, record: &ReconciliationRecord) {
        self.total += 1;
        match record.classification {
            Classification::Match => self.matched += 1,
            Classification::StatusMismatch => self.status_mismatched += 1,
            Classification::MissingRemotely => self.missing_remotely += 1,
            Classification::MissingLocally => self.missing_locally += 1,
            Classification::QueryFailed => self.query_failed += 1,
        }
        if !record.date_matches {
            self.date_mismatches += 1;
        }
    }
}

// =============================================================================
// Comparison
// =============================================================================

/// The authority state a local status implies, if any.
///
/// Documents still in flight locally imply nothing: any remote state is news.
pub fn expected_remote_state(status: DocumentStatus) -> Option<&'static str> {
    match status {
        DocumentStatus::Accepted => Some(STATE_PROCESSED),
        DocumentStatus::Rejected => Some(STATE_REJECTED),
        _ => None,
    }
}

/// Compares a local document with the authority's record of it.
pub fn compare(
    doc: &Document,
    remote: &RemoteDocumentStatus,
    timestamp_tolerance: Duration,
    queried_at: DateTime<Utc>,
) -> ReconciliationRecord {
    let mut record = ReconciliationRecord::local(doc, Classification::Match, QueryStatus::Success, queried_at)
        .with_remote(remote);
    let mut state_drift = false;

    match expected_remote_state(doc.status) {
        Some(expected) if !expected.eq_ignore_ascii_case(&remote.state) => {
            state_drift = true;
            record.discrepancies.push(format!(
                "state: local {} (expects {}), authority {}",
                doc.status, expected, remote.state
            ));
        }
        Some(_) => {}
        None => {
            state_drift = true;
            record.discrepancies.push(format!(
                "state: local {} but authority already reports {}",
                doc.status, remote.state
            ));
        }
    }

    // Seals only compared when both sides have one.
    if let (Some(local), Some(remote_seal)) = (&doc.authority.received_seal, &remote.received_seal) {
        if local != remote_seal {
            state_drift = true;
            record
                .discrepancies
                .push(format!("seal: local {}, authority {}", local, remote_seal));
        }
    }

    if let Some(raw) = remote.issued_on.as_deref() {
        match parse_authority_date(raw) {
            Some(remote_date) if remote_date != doc.issued_on => {
                record.date_matches = false;
                record.discrepancies.push(format!(
                    "issue date: local {}, authority {}",
                    doc.issued_on.format(AUTHORITY_DATE_FORMAT),
                    raw
                ));
            }
            Some(_) => {}
            None => record
                .discrepancies
                .push(format!("issue date: unparseable authority value '{}'", raw)),
        }
    }

    if let (Some(local), Some(raw)) = (doc.authority.processed_at, remote.processed_at.as_deref()) {
        if let Some(remote_ts) = parse_authority_timestamp(raw) {
            let skew = (local - remote_ts).num_seconds().unsigned_abs();
            if skew > timestamp_tolerance.as_secs() {
                record.date_matches = false;
                record.discrepancies.push(format!(
                    "processed at: local {}, authority {} ({}s apart)",
                    local.format(AUTHORITY_TIMESTAMP_FORMAT),
                    raw,
                    skew
                ));
            }
        }
    }

    if state_drift {
        record.classification = Classification::StatusMismatch;
    }
    record
}

/// The authority answered "not found" for a local document.
pub fn missing_remotely(doc: &Document, queried_at: DateTime<Utc>) -> ReconciliationRecord {
    let mut record =
        ReconciliationRecord::local(doc, Classification::MissingRemotely, QueryStatus::NotFound, queried_at);
    if doc.status == DocumentStatus::Accepted {
        record
            .discrepancies
            .push("document is accepted locally but unknown to the authority".to_string());
    } else {
        record
            .discrepancies
            .push(format!("document is {} locally and unknown to the authority", doc.status));
    }
    record
}

/// The authority could not be queried for a local document.
pub fn query_failed(doc: &Document, error: impl Into<String>, queried_at: DateTime<Utc>) -> ReconciliationRecord {
    let mut record =
        ReconciliationRecord::local(doc, Classification::QueryFailed, QueryStatus::Error, queried_at);
    record.error_message = Some(error.into());
    record
}

/// The authority listed a document with no local counterpart.
pub fn missing_locally(remote: &RemoteDocumentStatus, queried_at: DateTime<Utc>) -> ReconciliationRecord {
    ReconciliationRecord {
        generation_code: remote.generation_code.clone(),
        document_id: None,
        control_number: None,
        kind: None,
        issued_on: remote.issued_on.as_deref().and_then(parse_authority_date),
        local_status: None,
        local_seal: None,
        local_processed_at: None,
        remote_state: None,
        remote_seal: None,
        remote_processed_at: None,
        remote_issued_on: None,
        remote_message_code: None,
        remote_message_description: None,
        remote_observations: Vec::new(),
        classification: Classification::MissingLocally,
        date_matches: true,
        discrepancies: vec!["authority reports a document with no local record".to_string()],
        query_status: QueryStatus::Success,
        error_message: None,
        queried_at,
    }
    .with_remote(remote)
}

// =============================================================================
// Authority Date Parsing
// =============================================================================

pub fn parse_authority_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), AUTHORITY_DATE_FORMAT).ok()
}

pub fn parse_authority_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), AUTHORITY_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthorityFields, Environment, NewDocument, Scope};
    use chrono::TimeZone;

    fn accepted_doc() -> Document {
        let mut doc = Document::finalized(
            NewDocument {
                generation_code: Some("11111111-2222-3333-4444-555555555555".into()),
                control_number: "DTE-01-M001P001-000000000000007".into(),
                kind: DocumentKind::Invoice,
                scope: Scope::new("c", "e", "p", Environment::Test),
                issued_on: NaiveDate::from_ymd_opt(2024, 2, 10).unwrap(),
                signed_payload: "jws".into(),
            },
            Utc::now(),
        );
        doc.status = DocumentStatus::Accepted;
        doc.authority = AuthorityFields {
            state: Some(STATE_PROCESSED.into()),
            received_seal: Some("SEAL-1".into()),
            processed_at: Some(Utc.with_ymd_and_hms(2024, 2, 10, 14, 0, 0).unwrap()),
            ..Default::default()
        };
        doc
    }

    fn remote(state: &str) -> RemoteDocumentStatus {
        RemoteDocumentStatus {
            generation_code: "11111111-2222-3333-4444-555555555555".into(),
            state: state.into(),
            received_seal: Some("SEAL-1".into()),
            processed_at: Some("10/02/2024 14:00:30".into()),
            issued_on: Some("10/02/2024".into()),
            ..Default::default()
        }
    }

    const TOLERANCE: Duration = Duration::from_secs(60);

    #[test]
    fn test_match_within_tolerance() {
        let record = compare(&accepted_doc(), &remote(STATE_PROCESSED), TOLERANCE, Utc::now());
        assert_eq!(record.classification, Classification::Match);
        assert!(record.date_matches);
        assert!(record.discrepancies.is_empty());
    }

    #[test]
    fn test_state_mismatch() {
        let record = compare(&accepted_doc(), &remote(STATE_REJECTED), TOLERANCE, Utc::now());
        assert_eq!(record.classification, Classification::StatusMismatch);
        assert_eq!(record.discrepancies.len(), 1);
    }

    #[test]
    fn test_seal_mismatch() {
        let mut r = remote(STATE_PROCESSED);
        r.received_seal = Some("OTHER".into());
        let record = compare(&accepted_doc(), &r, TOLERANCE, Utc::now());
        assert_eq!(record.classification, Classification::StatusMismatch);

        r.received_seal = None;
        let record = compare(&accepted_doc(), &r, TOLERANCE, Utc::now());
        assert_eq!(record.classification, Classification::Match);
    }

    #[test]
    fn test_date_drift_does_not_change_classification() {
        let mut r = remote(STATE_PROCESSED);
        r.issued_on = Some("11/02/2024".into());
        r.processed_at = Some("10/02/2024 14:05:00".into());
        let record = compare(&accepted_doc(), &r, TOLERANCE, Utc::now());
        assert_eq!(record.classification, Classification::Match);
        assert!(!record.date_matches);
        assert_eq!(record.discrepancies.len(), 2);
    }

    #[test]
    fn test_pending_locally_but_known_remotely_is_stale() {
        let mut doc = accepted_doc();
        doc.status = DocumentStatus::ContingencyPending;
        doc.authority = AuthorityFields::default();
        let record = compare(&doc, &remote(STATE_PROCESSED), TOLERANCE, Utc::now());
        assert_eq!(record.classification, Classification::StatusMismatch);
    }

    #[test]
    fn test_missing_and_failed_records() {
        let doc = accepted_doc();
        let now = Utc::now();

        let missing = missing_remotely(&doc, now);
        assert_eq!(missing.classification, Classification::MissingRemotely);
        assert_eq!(missing.query_status, QueryStatus::NotFound);

        let failed = query_failed(&doc, "timeout", now);
        assert_eq!(failed.classification, Classification::QueryFailed);
        assert_eq!(failed.error_message.as_deref(), Some("timeout"));

        let orphan = missing_locally(&remote(STATE_PROCESSED), now);
        assert_eq!(orphan.classification, Classification::MissingLocally);
        assert!(orphan.document_id.is_none());

        let summary = ReconciliationSummary::tally([&missing, &failed, &orphan]);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.missing_remotely, 1);
        assert_eq!(summary.query_failed, 1);
        assert_eq!(summary.missing_locally, 1);
        assert_eq!(summary.matched, 0);
    }

    #[test]
    fn test_authority_formats() {
        assert_eq!(
            parse_authority_date("05/03/2024"),
            NaiveDate::from_ymd_opt(2024, 3, 5)
        );
        assert!(parse_authority_date("2024-03-05").is_none());
        assert_eq!(
            parse_authority_timestamp("05/03/2024 23:59:01"),
            Some(Utc.with_ymd_and_hms(2024, 3, 5, 23, 59, 1).unwrap())
        );
    }
}
