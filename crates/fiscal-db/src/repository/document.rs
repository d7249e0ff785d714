//! # Document Repository
//!
//! Database operations for fiscal documents.
//!
//! ## Who writes what
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  insert / mark_submitting / record_verdict    ← submission pipeline     │
//! │  increment_attempts                           ← submission pipeline     │
//! │  attach_to_period                             ← contingency manager     │
//! │  lote membership and poll verdicts            ← LoteRepository (tx)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every transition is guarded on the current status so a stale writer
//! touches no row instead of overwriting a newer state.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use fiscal_core::{
    AuthorityFields, AuthorityVerdict, DateRange, Document, DocumentKind, DocumentStatus,
    Environment, Scope,
};

pub(crate) const DOCUMENT_COLUMNS: &str = r#"
    id, generation_code, control_number, kind,
    company_id, establishment_id, point_of_sale_id, environment,
    issued_on, signed_payload, status, submission_attempts,
    contingency_period_id, lote_id,
    authority_state, received_seal, processed_at,
    message_code, message_description, observations,
    created_at, updated_at
"#;

/// Raw `documents` row.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct DocumentRow {
    id: String,
    generation_code: String,
    control_number: String,
    kind: DocumentKind,
    company_id: String,
    establishment_id: String,
    point_of_sale_id: String,
    environment: Environment,
    issued_on: NaiveDate,
    signed_payload: String,
    status: DocumentStatus,
    submission_attempts: i64,
    contingency_period_id: Option<String>,
    lote_id: Option<String>,
    authority_state: Option<String>,
    received_seal: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    message_code: Option<String>,
    message_description: Option<String>,
    observations: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DocumentRow {
    pub(crate) fn into_document(self) -> DbResult<Document> {
        let observations = match self.observations.as_deref() {
            None | Some("") => Vec::new(),
            Some(raw) => serde_json::from_str(raw).map_err(|e| DbError::decode("observations", e))?,
        };

        Ok(Document {
            id: self.id,
            generation_code: self.generation_code,
            control_number: self.control_number,
            kind: self.kind,
            scope: Scope::new(
                self.company_id,
                self.establishment_id,
                self.point_of_sale_id,
                self.environment,
            ),
            issued_on: self.issued_on,
            signed_payload: self.signed_payload,
            status: self.status,
            submission_attempts: self.submission_attempts,
            contingency_period_id: self.contingency_period_id,
            lote_id: self.lote_id,
            authority: AuthorityFields {
                state: self.authority_state,
                received_seal: self.received_seal,
                processed_at: self.processed_at,
                message_code: self.message_code,
                message_description: self.message_description,
                observations,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub(crate) fn rows_into_documents(rows: Vec<DocumentRow>) -> DbResult<Vec<Document>> {
    rows.into_iter().map(DocumentRow::into_document).collect()
}

/// Observations are stored as a JSON array; an empty list is stored as NULL.
pub(crate) fn encode_observations(observations: &[String]) -> Option<String> {
    if observations.is_empty() {
        None
    } else {
        serde_json::to_string(observations).ok()
    }
}

/// Count of documents per status, for period and lote breakdowns.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, sqlx::FromRow)]
pub struct StatusCount {
    pub status: DocumentStatus,
    pub count: i64,
}

/// Repository for document database operations.
#[derive(Debug, Clone)]
pub struct DocumentRepository {
    pool: SqlitePool,
}

impl DocumentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        DocumentRepository { pool }
    }

    /// Inserts a new document.
    ///
    /// ## Errors
    /// `UniqueViolation` if the generation code is already taken.
    pub async fn insert(&self, doc: &Document) -> DbResult<()> {
        debug!(document_id = %doc.id, generation_code = %doc.generation_code, "Inserting document");

        let result = sqlx::query(
            r#"
            INSERT INTO documents (
                id, generation_code, control_number, kind,
                company_id, establishment_id, point_of_sale_id, environment,
                issued_on, signed_payload, status, submission_attempts,
                contingency_period_id, lote_id,
                authority_state, received_seal, processed_at,
                message_code, message_description, observations,
                created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4,
                ?5, ?6, ?7, ?8,
                ?9, ?10, ?11, ?12,
                ?13, ?14,
                ?15, ?16, ?17,
                ?18, ?19, ?20,
                ?21, ?22
            )
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.generation_code)
        .bind(&doc.control_number)
        .bind(doc.kind)
        .bind(&doc.scope.company_id)
        .bind(&doc.scope.establishment_id)
        .bind(&doc.scope.point_of_sale_id)
        .bind(doc.scope.environment)
        .bind(doc.issued_on)
        .bind(&doc.signed_payload)
        .bind(doc.status)
        .bind(doc.submission_attempts)
        .bind(&doc.contingency_period_id)
        .bind(&doc.lote_id)
        .bind(&doc.authority.state)
        .bind(&doc.authority.received_seal)
        .bind(doc.authority.processed_at)
        .bind(&doc.authority.message_code)
        .bind(&doc.authority.message_description)
        .bind(encode_observations(&doc.authority.observations))
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => match DbError::from(e) {
                DbError::UniqueViolation { .. } => {
                    Err(DbError::duplicate("generation_code", &doc.generation_code))
                }
                other => Err(other),
            },
        }
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Document>> {
        let sql = format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS);
        let row: Option<DocumentRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(DocumentRow::into_document).transpose()
    }

    /// Looks a document up by its authority-facing code (case-insensitive).
    pub async fn get_by_generation_code(&self, code: &str) -> DbResult<Option<Document>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE generation_code = ?1",
            DOCUMENT_COLUMNS
        );
        let row: Option<DocumentRow> = sqlx::query_as(&sql)
            .bind(code.trim().to_uppercase())
            .fetch_optional(&self.pool)
            .await?;

        row.map(DocumentRow::into_document).transpose()
    }

    /// `draft → finalized`.
    pub async fn mark_finalized(&self, id: &str, now: DateTime<Utc>) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'finalized', updated_at = ?2 WHERE id = ?1 AND status = 'draft'",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.guard_failure(id, "draft").await);
        }
        Ok(())
    }

    /// `finalized → submitting`.
    pub async fn mark_submitting(&self, id: &str, now: DateTime<Utc>) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET status = 'submitting', updated_at = ?2
            WHERE id = ?1 AND status = 'finalized'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.guard_failure(id, "finalized").await);
        }
        Ok(())
    }

    /// Stamps a definitive authority verdict on a document that is being
    /// submitted or waiting in contingency.
    ///
    /// Returns `false` if the document was already terminal; the stored
    /// verdict is never overwritten.
    pub async fn record_verdict(
        &self,
        id: &str,
        verdict: &AuthorityVerdict,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let fields = &verdict.fields;
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET status = ?2,
                authority_state = ?3,
                received_seal = ?4,
                processed_at = ?5,
                message_code = ?6,
                message_description = ?7,
                observations = ?8,
                updated_at = ?9
            WHERE id = ?1 AND status IN ('submitting', 'contingency_pending')
            "#,
        )
        .bind(id)
        .bind(verdict.status())
        .bind(&fields.state)
        .bind(&fields.received_seal)
        .bind(fields.processed_at)
        .bind(&fields.message_code)
        .bind(&fields.message_description)
        .bind(encode_observations(&fields.observations))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Counts one more transient submission failure. Returns the new count.
    pub async fn increment_attempts(&self, id: &str, now: DateTime<Utc>) -> DbResult<i64> {
        let attempts: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE documents
            SET submission_attempts = submission_attempts + 1, updated_at = ?2
            WHERE id = ?1
            RETURNING submission_attempts
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        attempts.ok_or_else(|| DbError::not_found("Document", id))
    }

    /// Attaches a document to a contingency period and moves it to
    /// `contingency_pending`.
    ///
    /// The period must still be `active` and share the document's scope, both
    /// checked in the same statement. Returns `false` when the guard fails
    /// (period no longer active, document already attached or in the wrong
    /// status); the caller re-reads to tell which.
    pub async fn attach_to_period(
        &self,
        document_id: &str,
        period_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET status = 'contingency_pending',
                contingency_period_id = ?2,
                updated_at = ?3
            WHERE id = ?1
              AND contingency_period_id IS NULL
              AND status IN ('submitting', 'contingency_pending')
              AND EXISTS (
                  SELECT 1 FROM contingency_periods p
                  WHERE p.id = ?2
                    AND p.status = 'active'
                    AND p.company_id = documents.company_id
                    AND p.establishment_id = documents.establishment_id
                    AND p.point_of_sale_id = documents.point_of_sale_id
                    AND p.environment = documents.environment
              )
            "#,
        )
        .bind(document_id)
        .bind(period_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Backlog documents of a period that are not in any lote yet.
    pub async fn list_unbatched_for_period(&self, period_id: &str) -> DbResult<Vec<Document>> {
        let sql = format!(
            r#"
            SELECT {} FROM documents
            WHERE contingency_period_id = ?1
              AND lote_id IS NULL
              AND status = 'contingency_pending'
            ORDER BY created_at, control_number
            "#,
            DOCUMENT_COLUMNS
        );
        let rows: Vec<DocumentRow> = sqlx::query_as(&sql)
            .bind(period_id)
            .fetch_all(&self.pool)
            .await?;

        rows_into_documents(rows)
    }

    pub async fn list_for_period(&self, period_id: &str) -> DbResult<Vec<Document>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE contingency_period_id = ?1 ORDER BY created_at, control_number",
            DOCUMENT_COLUMNS
        );
        let rows: Vec<DocumentRow> = sqlx::query_as(&sql)
            .bind(period_id)
            .fetch_all(&self.pool)
            .await?;

        rows_into_documents(rows)
    }

    pub async fn list_for_lote(&self, lote_id: &str) -> DbResult<Vec<Document>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE lote_id = ?1 ORDER BY created_at, control_number",
            DOCUMENT_COLUMNS
        );
        let rows: Vec<DocumentRow> = sqlx::query_as(&sql)
            .bind(lote_id)
            .fetch_all(&self.pool)
            .await?;

        rows_into_documents(rows)
    }

    /// (generation code, kind) of every document in a period, in issue order.
    /// This is the item list of the period's notification.
    pub async fn period_codes(&self, period_id: &str) -> DbResult<Vec<(String, DocumentKind)>> {
        let rows: Vec<(String, DocumentKind)> = sqlx::query_as(
            r#"
            SELECT generation_code, kind FROM documents
            WHERE contingency_period_id = ?1
            ORDER BY created_at, control_number
            "#,
        )
        .bind(period_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn status_breakdown_for_period(&self, period_id: &str) -> DbResult<Vec<StatusCount>> {
        let counts: Vec<StatusCount> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) AS count FROM documents
            WHERE contingency_period_id = ?1
            GROUP BY status
            ORDER BY status
            "#,
        )
        .bind(period_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(counts)
    }

    pub async fn status_breakdown_for_lote(&self, lote_id: &str) -> DbResult<Vec<StatusCount>> {
        let counts: Vec<StatusCount> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) AS count FROM documents
            WHERE lote_id = ?1
            GROUP BY status
            ORDER BY status
            "#,
        )
        .bind(lote_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(counts)
    }

    /// Non-draft documents of a scope issued within `range` (inclusive).
    pub async fn list_in_range(&self, scope: &Scope, range: &DateRange) -> DbResult<Vec<Document>> {
        let sql = format!(
            r#"
            SELECT {} FROM documents
            WHERE company_id = ?1
              AND establishment_id = ?2
              AND point_of_sale_id = ?3
              AND environment = ?4
              AND issued_on BETWEEN ?5 AND ?6
              AND status != 'draft'
            ORDER BY issued_on, control_number
            "#,
            DOCUMENT_COLUMNS
        );
        let rows: Vec<DocumentRow> = sqlx::query_as(&sql)
            .bind(&scope.company_id)
            .bind(&scope.establishment_id)
            .bind(&scope.point_of_sale_id)
            .bind(scope.environment)
            .bind(range.from)
            .bind(range.to)
            .fetch_all(&self.pool)
            .await?;

        rows_into_documents(rows)
    }

    /// Documents still `submitting` whose last write is older than
    /// `updated_before`: the submitting call died before recording an
    /// outcome. Oldest first.
    pub async fn list_stranded_submitting(
        &self,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> DbResult<Vec<Document>> {
        let sql = format!(
            r#"
            SELECT {} FROM documents
            WHERE status = 'submitting'
              AND contingency_period_id IS NULL
              AND updated_at < ?1
            ORDER BY updated_at
            LIMIT ?2
            "#,
            DOCUMENT_COLUMNS
        );
        let rows: Vec<DocumentRow> = sqlx::query_as(&sql)
            .bind(updated_before)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows_into_documents(rows)
    }

    pub async fn count_by_status(&self, status: DocumentStatus) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE status = ?1")
            .bind(status)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Distinguishes a missing row from a row in the wrong state.
    async fn guard_failure(&self, id: &str, expected: &str) -> DbError {
        match self.get_by_id(id).await {
            Ok(Some(_)) => DbError::precondition("Document", id, expected),
            Ok(None) => DbError::not_found("Document", id),
            Err(e) => e,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::{db, new_document, scope};
    use fiscal_core::{ContingencyCause, ContingencyType, STATE_PROCESSED, STATE_REJECTED};

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let db = db().await;
        let repo = db.documents();
        let doc = Document::finalized(new_document(&scope(), 1), Utc::now());

        repo.insert(&doc).await.unwrap();

        let by_id = repo.get_by_id(&doc.id).await.unwrap().unwrap();
        assert_eq!(by_id.generation_code, doc.generation_code);
        assert_eq!(by_id.status, DocumentStatus::Finalized);
        assert_eq!(by_id.scope, scope());

        let by_code = repo
            .get_by_generation_code(&doc.generation_code.to_lowercase())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_code.id, doc.id);
    }

    #[tokio::test]
    async fn test_duplicate_generation_code() {
        let db = db().await;
        let repo = db.documents();
        let doc = Document::finalized(new_document(&scope(), 1), Utc::now());
        repo.insert(&doc).await.unwrap();

        let mut clash = Document::finalized(new_document(&scope(), 2), Utc::now());
        clash.generation_code = doc.generation_code.clone();
        let err = repo.insert(&clash).await.unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn test_submitting_guard() {
        let db = db().await;
        let repo = db.documents();
        let doc = Document::finalized(new_document(&scope(), 1), Utc::now());
        repo.insert(&doc).await.unwrap();

        repo.mark_submitting(&doc.id, Utc::now()).await.unwrap();
        let err = repo.mark_submitting(&doc.id, Utc::now()).await.unwrap_err();
        assert!(err.is_precondition_failed());

        let err = repo.mark_submitting("missing", Utc::now()).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_stranded_submitting_listing() {
        let db = db().await;
        let repo = db.documents();
        let now = Utc::now();

        let stranded = Document::finalized(new_document(&scope(), 1), now);
        repo.insert(&stranded).await.unwrap();
        repo.mark_submitting(&stranded.id, now - chrono::Duration::minutes(10)).await.unwrap();

        let idle = Document::finalized(new_document(&scope(), 2), now);
        repo.insert(&idle).await.unwrap();

        let found = repo
            .list_stranded_submitting(now - chrono::Duration::minutes(5), 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stranded.id);

        assert!(repo
            .list_stranded_submitting(now - chrono::Duration::minutes(20), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_verdict_is_final() {
        let db = db().await;
        let repo = db.documents();
        let doc = Document::finalized(new_document(&scope(), 1), Utc::now());
        repo.insert(&doc).await.unwrap();
        repo.mark_submitting(&doc.id, Utc::now()).await.unwrap();

        let accepted = AuthorityVerdict::from_state(
            &doc.generation_code,
            AuthorityFields {
                state: Some(STATE_PROCESSED.into()),
                received_seal: Some("SEAL".into()),
                observations: vec!["obs 1".into()],
                ..Default::default()
            },
        );
        assert!(repo.record_verdict(&doc.id, &accepted, Utc::now()).await.unwrap());

        let rejected = AuthorityVerdict::from_state(
            &doc.generation_code,
            AuthorityFields {
                state: Some(STATE_REJECTED.into()),
                ..Default::default()
            },
        );
        assert!(!repo.record_verdict(&doc.id, &rejected, Utc::now()).await.unwrap());

        let stored = repo.get_by_id(&doc.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Accepted);
        assert_eq!(stored.authority.received_seal.as_deref(), Some("SEAL"));
        assert_eq!(stored.authority.observations, vec!["obs 1".to_string()]);
    }

    #[tokio::test]
    async fn test_attempt_counter() {
        let db = db().await;
        let repo = db.documents();
        let doc = Document::finalized(new_document(&scope(), 1), Utc::now());
        repo.insert(&doc).await.unwrap();

        assert_eq!(repo.increment_attempts(&doc.id, Utc::now()).await.unwrap(), 1);
        assert_eq!(repo.increment_attempts(&doc.id, Utc::now()).await.unwrap(), 2);
        assert!(repo.increment_attempts("nope", Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_attach_requires_active_period_of_same_scope() {
        let db = db().await;
        let repo = db.documents();
        let cause = ContingencyCause::new(ContingencyType::AuthorityUnavailable, "timeout");
        let period = db
            .periods()
            .find_or_create_active(&scope(), &cause, Utc::now())
            .await
            .unwrap();

        let doc = Document::finalized(new_document(&scope(), 1), Utc::now());
        repo.insert(&doc).await.unwrap();
        repo.mark_submitting(&doc.id, Utc::now()).await.unwrap();
        assert!(repo.attach_to_period(&doc.id, &period.id, Utc::now()).await.unwrap());
        // Already attached: no-op
        assert!(!repo.attach_to_period(&doc.id, &period.id, Utc::now()).await.unwrap());

        let mut other_scope = scope();
        other_scope.point_of_sale_id = "P002".into();
        let foreign = Document::finalized(new_document(&other_scope, 2), Utc::now());
        repo.insert(&foreign).await.unwrap();
        repo.mark_submitting(&foreign.id, Utc::now()).await.unwrap();
        assert!(!repo.attach_to_period(&foreign.id, &period.id, Utc::now()).await.unwrap());

        db.periods().begin_reporting(&period.id, Utc::now()).await.unwrap();
        let late = Document::finalized(new_document(&scope(), 3), Utc::now());
        repo.insert(&late).await.unwrap();
        repo.mark_submitting(&late.id, Utc::now()).await.unwrap();
        assert!(!repo.attach_to_period(&late.id, &period.id, Utc::now()).await.unwrap());

        let attached = repo.get_by_id(&doc.id).await.unwrap().unwrap();
        assert_eq!(attached.status, DocumentStatus::ContingencyPending);
        assert_eq!(attached.contingency_period_id.as_deref(), Some(period.id.as_str()));

        let breakdown = repo.status_breakdown_for_period(&period.id).await.unwrap();
        assert_eq!(
            breakdown,
            vec![StatusCount {
                status: DocumentStatus::ContingencyPending,
                count: 1
            }]
        );
        assert_eq!(repo.period_codes(&period.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_draft_is_finalized_once() {
        let db = db().await;
        let repo = db.documents();

        let mut doc = Document::finalized(new_document(&scope(), 9), Utc::now());
        doc.status = DocumentStatus::Draft;
        repo.insert(&doc).await.unwrap();

        repo.mark_finalized(&doc.id, Utc::now()).await.unwrap();
        let stored = repo.get_by_id(&doc.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Finalized);

        let err = repo.mark_finalized(&doc.id, Utc::now()).await.unwrap_err();
        assert!(err.is_precondition_failed());
    }

    #[tokio::test]
    async fn test_list_in_range_excludes_drafts() {
        let db = db().await;
        let repo = db.documents();

        let mut inside = Document::finalized(new_document(&scope(), 1), Utc::now());
        inside.issued_on = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let mut draft = Document::finalized(new_document(&scope(), 2), Utc::now());
        draft.status = DocumentStatus::Draft;
        draft.issued_on = inside.issued_on;
        let mut outside = Document::finalized(new_document(&scope(), 3), Utc::now());
        outside.issued_on = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();

        for doc in [&inside, &draft, &outside] {
            repo.insert(doc).await.unwrap();
        }

        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
        );
        let found = repo.list_in_range(&scope(), &range).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, inside.id);
    }

    #[tokio::test]
    async fn test_documents_cannot_be_deleted() {
        let db = db().await;
        let doc = Document::finalized(new_document(&scope(), 1), Utc::now());
        db.documents().insert(&doc).await.unwrap();

        let err: DbError = sqlx::query("DELETE FROM documents WHERE id = ?1")
            .bind(&doc.id)
            .execute(db.pool())
            .await
            .unwrap_err()
            .into();
        assert!(err.is_invariant_violation());
    }
}
