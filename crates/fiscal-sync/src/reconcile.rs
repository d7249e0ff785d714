//! # Reconciliation Engine
//!
//! Read-only audit of local documents against the authority's records.
//! Queries run with bounded concurrency; classification itself lives in
//! [`fiscal_core::reconcile`]. Nothing here writes to the database.

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use fiscal_core::reconcile::{
    compare, missing_locally, missing_remotely, parse_authority_date, query_failed,
    AUTHORITY_TIMESTAMP_FORMAT,
};
use fiscal_core::validation::validate_date_range;
use fiscal_core::{DateRange, Document, ReconciliationRecord, ReconciliationSummary, Scope};
use fiscal_db::Database;

use crate::error::{SyncError, SyncResult};
use crate::gateway::{with_timeout, AuthorityGateway, DocumentQuery};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    /// Keep matching documents in the detail list. The summary always
    /// counts them.
    pub include_matches: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub scope: Scope,
    pub range: DateRange,
    pub summary: ReconciliationSummary,
    pub records: Vec<ReconciliationRecord>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    db: Arc<Database>,
    gateway: Arc<dyn AuthorityGateway>,
    tolerance: Duration,
    concurrency: usize,
    attempt_timeout: Duration,
}

impl ReconciliationEngine {
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn AuthorityGateway>,
        tolerance: Duration,
        concurrency: usize,
        attempt_timeout: Duration,
    ) -> Self {
        ReconciliationEngine {
            db,
            gateway,
            tolerance,
            concurrency: concurrency.max(1),
            attempt_timeout,
        }
    }

    /// Compares every non-draft document of `scope` issued in `range`.
    pub async fn reconcile(
        &self,
        scope: &Scope,
        range: &DateRange,
        options: ReconcileOptions,
    ) -> SyncResult<ReconciliationReport> {
        validate_date_range(range)?;
        let documents = self.db.documents().list_in_range(scope, range).await?;
        info!(scope = %scope, from = %range.from, to = %range.to, documents = documents.len(), "Reconciling");

        let mut records: Vec<ReconciliationRecord> = stream::iter(documents.iter())
            .map(|doc| self.check(doc))
            .buffered(self.concurrency)
            .collect()
            .await;

        records.extend(self.unknown_locally(scope, range, &documents).await?);

        let summary = ReconciliationSummary::tally(&records);
        if !options.include_matches {
            records.retain(|r| !r.is_match());
        }

        info!(
            total = summary.total,
            matched = summary.matched,
            status_mismatched = summary.status_mismatched,
            missing_remotely = summary.missing_remotely,
            missing_locally = summary.missing_locally,
            query_failed = summary.query_failed,
            date_mismatches = summary.date_mismatches,
            "Reconciliation finished"
        );

        Ok(ReconciliationReport {
            scope: scope.clone(),
            range: *range,
            summary,
            records,
            generated_at: Utc::now(),
        })
    }

    /// Compares a single document by generation code.
    pub async fn reconcile_document(&self, generation_code: &str) -> SyncResult<ReconciliationRecord> {
        let document = self
            .db
            .documents()
            .get_by_generation_code(generation_code)
            .await?
            .ok_or_else(|| SyncError::not_found("Document", generation_code))?;
        Ok(self.check(&document).await)
    }

    async fn check(&self, document: &Document) -> ReconciliationRecord {
        let query = DocumentQuery {
            generation_code: document.generation_code.clone(),
            kind: document.kind,
            environment: document.scope.environment,
        };

        let result = with_timeout(self.attempt_timeout, self.gateway.query_document_status(&query)).await;
        let queried_at = Utc::now();
        match result {
            Ok(Some(remote)) => compare(document, &remote, self.tolerance, queried_at),
            Ok(None) => missing_remotely(document, queried_at),
            Err(e) => {
                debug!(generation_code = %document.generation_code, error = %e, "Status query failed");
                query_failed(document, e.to_string(), queried_at)
            }
        }
    }

    /// Documents the authority lists that have no local row. Only available
    /// when the gateway offers a listing.
    async fn unknown_locally(
        &self,
        scope: &Scope,
        range: &DateRange,
        local: &[Document],
    ) -> SyncResult<Vec<ReconciliationRecord>> {
        let listed = match with_timeout(self.attempt_timeout, self.gateway.list_documents(scope, range)).await {
            Ok(Some(listed)) => listed,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => {
                warn!(error = %e, "Authority listing failed, missing_locally not checked");
                return Ok(Vec::new());
            }
        };

        let known: HashSet<String> = local.iter().map(|d| d.generation_code.to_uppercase()).collect();
        let documents = self.db.documents();
        let queried_at = Utc::now();
        let mut records = Vec::new();

        for remote in listed {
            if known.contains(&remote.generation_code.to_uppercase()) {
                continue;
            }
            let in_range = remote
                .issued_on
                .as_deref()
                .and_then(parse_authority_date)
                .map_or(true, |date| range.contains(date));
            if !in_range {
                continue;
            }
            // Held locally under another scope or date.
            if documents
                .get_by_generation_code(&remote.generation_code)
                .await?
                .is_some()
            {
                continue;
            }
            records.push(missing_locally(&remote, queried_at));
        }
        Ok(records)
    }
}

// =============================================================================
// CSV Export
// =============================================================================

const DETAIL_HEADER: [&str; 18] = [
    "generation_code",
    "document_id",
    "control_number",
    "kind",
    "issued_on",
    "classification",
    "local_status",
    "remote_state",
    "local_seal",
    "remote_seal",
    "local_processed_at",
    "remote_processed_at",
    "remote_issued_on",
    "date_matches",
    "query_status",
    "discrepancies",
    "error_message",
    "queried_at",
];

/// Writes a report as CSV: a summary block, a blank line, then one row per
/// record under a header.
pub fn export_csv<W: Write>(report: &ReconciliationReport, writer: W) -> SyncResult<()> {
    let summary = &report.summary;
    let mut out = csv::Writer::from_writer(writer);

    out.write_record(["metric", "value"])?;
    let rows: [(&str, String); 11] = [
        ("scope", report.scope.to_string()),
        ("from", report.range.from.to_string()),
        ("to", report.range.to.to_string()),
        ("generated_at", report.generated_at.to_rfc3339()),
        ("total", summary.total.to_string()),
        ("matched", summary.matched.to_string()),
        ("status_mismatched", summary.status_mismatched.to_string()),
        ("missing_remotely", summary.missing_remotely.to_string()),
        ("missing_locally", summary.missing_locally.to_string()),
        ("query_failed", summary.query_failed.to_string()),
        ("date_mismatches", summary.date_mismatches.to_string()),
    ];
    for (metric, value) in &rows {
        out.write_record([*metric, value.as_str()])?;
    }

    let mut raw = out
        .into_inner()
        .map_err(|e| SyncError::ExportFailed(e.to_string()))?;
    raw.write_all(b"\n")
        .map_err(|e| SyncError::ExportFailed(e.to_string()))?;

    let mut out = csv::Writer::from_writer(raw);
    out.write_record(DETAIL_HEADER)?;
    for record in &report.records {
        out.write_record(detail_row(record))?;
    }
    out.flush().map_err(|e| SyncError::ExportFailed(e.to_string()))?;
    Ok(())
}

/// [`export_csv`] into a string.
pub fn export_csv_string(report: &ReconciliationReport) -> SyncResult<String> {
    let mut buf = Vec::new();
    export_csv(report, &mut buf)?;
    String::from_utf8(buf).map_err(|e| SyncError::ExportFailed(e.to_string()))
}

fn detail_row(record: &ReconciliationRecord) -> [String; 18] {
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();
    [
        record.generation_code.clone(),
        opt(&record.document_id),
        opt(&record.control_number),
        record.kind.map(|k| k.code().to_string()).unwrap_or_default(),
        record.issued_on.map(|d| d.to_string()).unwrap_or_default(),
        record.classification.to_string(),
        record.local_status.map(|s| s.to_string()).unwrap_or_default(),
        opt(&record.remote_state),
        opt(&record.local_seal),
        opt(&record.remote_seal),
        record
            .local_processed_at
            .map(|t| t.format(AUTHORITY_TIMESTAMP_FORMAT).to_string())
            .unwrap_or_default(),
        opt(&record.remote_processed_at),
        opt(&record.remote_issued_on),
        record.date_matches.to_string(),
        record.query_status.to_string(),
        record.discrepancies.join("; "),
        opt(&record.error_message),
        record.queried_at.to_rfc3339(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::AuthorityError;
    use crate::simulated::{Operation, SimulatedAuthority};
    use chrono::NaiveDate;
    use fiscal_core::{
        AuthorityVerdict, Classification, DocumentKind, DocumentStatus, Environment, NewDocument,
        RemoteDocumentStatus, STATE_PROCESSED,
    };
    use fiscal_db::DbConfig;

    fn scope() -> Scope {
        Scope::new("company-1", "M001", "P001", Environment::Test)
    }

    fn june(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    async fn setup() -> (Arc<Database>, Arc<SimulatedAuthority>, ReconciliationEngine) {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let authority = Arc::new(SimulatedAuthority::new());
        let engine = ReconciliationEngine::new(
            db.clone(),
            authority.clone(),
            Duration::from_secs(60),
            4,
            Duration::from_secs(5),
        );
        (db, authority, engine)
    }

    /// Stores a document and, when `accept` is set, submits it directly to the
    /// simulated authority and records the verdict.
    async fn document(db: &Database, authority: &SimulatedAuthority, n: u32, accept: bool) -> Document {
        let doc = Document::finalized(
            NewDocument {
                generation_code: None,
                control_number: format!("DTE-01-M001P001-{:015}", n),
                kind: DocumentKind::Invoice,
                scope: scope(),
                issued_on: june(1),
                signed_payload: format!("signed-{}", n),
            },
            Utc::now(),
        );
        db.documents().insert(&doc).await.unwrap();
        if accept {
            db.documents().mark_submitting(&doc.id, Utc::now()).await.unwrap();
            let verdict: AuthorityVerdict = authority
                .submit_document(&crate::gateway::DocumentSubmission::from_submittable(&doc))
                .await
                .unwrap();
            db.documents().record_verdict(&doc.id, &verdict, Utc::now()).await.unwrap();
        }
        db.documents().get_by_id(&doc.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_matching_documents() {
        let (db, authority, engine) = setup().await;
        document(&db, &authority, 1, true).await;
        document(&db, &authority, 2, true).await;

        let report = engine
            .reconcile(&scope(), &DateRange::new(june(1), june(30)), ReconcileOptions::default())
            .await
            .unwrap();

        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.matched, 2);
        assert!(report.records.is_empty());

        let with_matches = engine
            .reconcile(
                &scope(),
                &DateRange::new(june(1), june(30)),
                ReconcileOptions { include_matches: true },
            )
            .await
            .unwrap();
        assert_eq!(with_matches.records.len(), 2);
    }

    #[tokio::test]
    async fn test_accepted_but_unknown_remotely() {
        let (db, authority, engine) = setup().await;
        let doc = document(&db, &authority, 1, true).await;
        assert_eq!(doc.status, DocumentStatus::Accepted);
        authority.remove_record(&doc.generation_code);

        let record = engine.reconcile_document(&doc.generation_code).await.unwrap();
        assert_eq!(record.classification, Classification::MissingRemotely);
    }

    #[tokio::test]
    async fn test_seal_drift_is_a_mismatch() {
        let (db, authority, engine) = setup().await;
        let doc = document(&db, &authority, 1, true).await;
        let mut remote = authority.record(&doc.generation_code).unwrap();
        remote.received_seal = Some("OTHER-SEAL".into());
        authority.insert_record(remote);

        let record = engine.reconcile_document(&doc.generation_code).await.unwrap();
        assert_eq!(record.classification, Classification::StatusMismatch);
        assert!(record.discrepancies.iter().any(|d| d.contains("OTHER-SEAL")));
    }

    #[tokio::test]
    async fn test_query_failure_is_reported_not_raised() {
        let (db, authority, engine) = setup().await;
        let doc = document(&db, &authority, 1, true).await;
        authority.fail_next(
            Operation::QueryDocumentStatus,
            [AuthorityError::Connection("refused".into())],
        );

        let record = engine.reconcile_document(&doc.generation_code).await.unwrap();
        assert_eq!(record.classification, Classification::QueryFailed);
        assert!(record.error_message.is_some());
    }

    #[tokio::test]
    async fn test_listing_finds_missing_locally() {
        let (db, authority, engine) = setup().await;
        document(&db, &authority, 1, true).await;
        authority.enable_listing();
        authority.insert_record(RemoteDocumentStatus {
            generation_code: "0D6B1F64-0000-4000-8000-0000000000AA".into(),
            state: STATE_PROCESSED.into(),
            received_seal: Some("2024SEAL".into()),
            processed_at: Some("01/06/2024 10:00:00".into()),
            issued_on: Some("01/06/2024".into()),
            ..Default::default()
        });

        let report = engine
            .reconcile(&scope(), &DateRange::new(june(1), june(30)), ReconcileOptions::default())
            .await
            .unwrap();
        assert_eq!(report.summary.missing_locally, 1);
        assert_eq!(report.summary.matched, 1);
    }

    #[tokio::test]
    async fn test_reconcile_does_not_mutate() {
        let (db, authority, engine) = setup().await;
        let doc = document(&db, &authority, 1, true).await;
        authority.remove_record(&doc.generation_code);

        engine
            .reconcile(&scope(), &DateRange::new(june(1), june(30)), ReconcileOptions::default())
            .await
            .unwrap();
        let after = db.documents().get_by_id(&doc.id).await.unwrap().unwrap();
        assert_eq!(after, doc);
    }

    #[tokio::test]
    async fn test_inverted_range_is_refused() {
        let (_, _, engine) = setup().await;
        let err = engine
            .reconcile(&scope(), &DateRange::new(june(30), june(1)), ReconcileOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Core(_)));
    }

    #[tokio::test]
    async fn test_csv_layout() {
        let (db, authority, engine) = setup().await;
        let doc = document(&db, &authority, 1, true).await;
        authority.remove_record(&doc.generation_code);

        let report = engine
            .reconcile(&scope(), &DateRange::new(june(1), june(30)), ReconcileOptions::default())
            .await
            .unwrap();
        let csv = export_csv_string(&report).unwrap();

        let (summary, detail) = csv.split_once("\n\n").unwrap();
        assert!(summary.starts_with("metric,value\n"));
        assert!(summary.contains("missing_remotely,1"));

        let mut lines = detail.lines();
        assert!(lines.next().unwrap().starts_with("generation_code,document_id"));
        let row = lines.next().unwrap();
        assert!(row.starts_with(&doc.generation_code));
        assert!(row.contains("missing_remotely"));
        assert!(lines.next().is_none());
    }
}
