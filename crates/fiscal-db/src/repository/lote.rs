//! # Lote Repository
//!
//! Lotes and their document membership. Every write that touches both a lote
//! and its documents runs in one transaction, so an interrupted batch or poll
//! leaves both sides as they were.
//!
//! ## Transitions
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  create_with_documents   (tx) lote 'pending' + documents.lote_id       │
//! │  mark_submitted          pending → submitted (+ batch code)            │
//! │  mark_polled             submitted → processing, last_polled_at        │
//! │  apply_results           (tx) document verdicts, then                  │
//! │                          processing | completed                        │
//! │  mark_failed_and_release (tx) → failed, non-terminal documents         │
//! │                          get lote_id = NULL                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The schema trigger `trg_documents_lote_scope` rejects any document whose
//! scope differs from its lote's; that surfaces as
//! [`DbError::InvariantViolation`].

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::claim_cutoff;
use super::document::encode_observations;
use crate::error::{DbError, DbResult};
use fiscal_core::{AuthorityVerdict, Environment, Lote, LoteStatus, Scope};

const LOTE_COLUMNS: &str = r#"
    id, period_id, company_id, establishment_id, point_of_sale_id, environment,
    status, batch_code, document_count, stale, processing, claimed_at,
    authority_response, failure_reason, submitted_at, last_polled_at, completed_at,
    created_at, updated_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct LoteRow {
    id: String,
    period_id: Option<String>,
    company_id: String,
    establishment_id: String,
    point_of_sale_id: String,
    environment: Environment,
    status: LoteStatus,
    batch_code: Option<String>,
    document_count: i64,
    stale: bool,
    processing: bool,
    claimed_at: Option<DateTime<Utc>>,
    authority_response: Option<String>,
    failure_reason: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
    last_polled_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<LoteRow> for Lote {
    fn from(row: LoteRow) -> Self {
        Lote {
            id: row.id,
            period_id: row.period_id,
            scope: Scope::new(
                row.company_id,
                row.establishment_id,
                row.point_of_sale_id,
                row.environment,
            ),
            status: row.status,
            batch_code: row.batch_code,
            document_count: row.document_count,
            stale: row.stale,
            processing: row.processing,
            claimed_at: row.claimed_at,
            authority_response: row.authority_response,
            failure_reason: row.failure_reason,
            submitted_at: row.submitted_at,
            last_polled_at: row.last_polled_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoteFilter {
    pub status: Option<LoteStatus>,
    pub period_id: Option<String>,
    pub limit: Option<u32>,
}

/// What one `apply_results` call changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedResults {
    /// Documents that received a verdict in this call.
    pub applied: usize,
    /// Documents of the lote still without a verdict.
    pub remaining: i64,
    /// Lote status after the call.
    pub status: LoteStatus,
}

/// Repository for lotes.
#[derive(Debug, Clone)]
pub struct LoteRepository {
    pool: SqlitePool,
}

impl LoteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        LoteRepository { pool }
    }

    /// Creates a `pending` lote and attaches the documents to it in one
    /// transaction.
    ///
    /// Every document must still be `contingency_pending`, outside any lote
    /// and (when `period_id` is given) belong to that period. If any of them
    /// is not, nothing is written.
    pub async fn create_with_documents(
        &self,
        period_id: Option<&str>,
        scope: &Scope,
        document_ids: &[String],
        now: DateTime<Utc>,
    ) -> DbResult<Lote> {
        let lote = Lote {
            id: Uuid::new_v4().to_string(),
            period_id: period_id.map(str::to_string),
            scope: scope.clone(),
            status: LoteStatus::Pending,
            batch_code: None,
            document_count: document_ids.len() as i64,
            stale: false,
            processing: false,
            claimed_at: None,
            authority_response: None,
            failure_reason: None,
            submitted_at: None,
            last_polled_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO lotes (
                id, period_id, company_id, establishment_id, point_of_sale_id, environment,
                status, document_count, stale, processing, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, 0, 0, ?8, ?8)
            "#,
        )
        .bind(&lote.id)
        .bind(&lote.period_id)
        .bind(&scope.company_id)
        .bind(&scope.establishment_id)
        .bind(&scope.point_of_sale_id)
        .bind(scope.environment)
        .bind(lote.document_count)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for document_id in document_ids {
            let result = sqlx::query(
                r#"
                UPDATE documents
                SET lote_id = ?2, updated_at = ?3
                WHERE id = ?1
                  AND lote_id IS NULL
                  AND status = 'contingency_pending'
                  AND (?4 IS NULL OR contingency_period_id = ?4)
                "#,
            )
            .bind(document_id)
            .bind(&lote.id)
            .bind(now)
            .bind(period_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                // Dropping tx rolls back the lote insert
                return Err(DbError::precondition(
                    "Document",
                    document_id.as_str(),
                    "unbatched contingency_pending",
                ));
            }
        }

        tx.commit().await?;

        info!(
            lote_id = %lote.id,
            scope = %scope,
            documents = document_ids.len(),
            "Lote created"
        );
        Ok(lote)
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Lote>> {
        let sql = format!("SELECT {} FROM lotes WHERE id = ?1", LOTE_COLUMNS);
        let row: Option<LoteRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    /// Lists lotes, newest first.
    pub async fn list(&self, filter: &LoteFilter) -> DbResult<Vec<Lote>> {
        let sql = format!(
            r#"
            SELECT {} FROM lotes
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR period_id = ?2)
            ORDER BY created_at DESC
            LIMIT ?3
            "#,
            LOTE_COLUMNS
        );
        let rows: Vec<LoteRow> = sqlx::query_as(&sql)
            .bind(filter.status)
            .bind(&filter.period_id)
            .bind(filter.limit.map(i64::from).unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Lotes in one status, oldest first (work-queue order).
    pub async fn list_by_status(&self, status: LoteStatus, limit: u32) -> DbResult<Vec<Lote>> {
        let sql = format!(
            "SELECT {} FROM lotes WHERE status = ?1 ORDER BY created_at LIMIT ?2",
            LOTE_COLUMNS
        );
        let rows: Vec<LoteRow> = sqlx::query_as(&sql)
            .bind(status)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Submitted or processing lotes, least recently polled first.
    pub async fn list_outstanding(&self, limit: u32) -> DbResult<Vec<Lote>> {
        let sql = format!(
            r#"
            SELECT {} FROM lotes
            WHERE status IN ('submitted', 'processing')
            ORDER BY last_polled_at IS NOT NULL, last_polled_at, submitted_at
            LIMIT ?1
            "#,
            LOTE_COLUMNS
        );
        let rows: Vec<LoteRow> = sqlx::query_as(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Takes the sweep claim on a lote; claims older than `ttl` are taken over.
    pub async fn claim(&self, id: &str, now: DateTime<Utc>, ttl: Duration) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE lotes
            SET processing = 1, claimed_at = ?2
            WHERE id = ?1 AND (processing = 0 OR claimed_at IS NULL OR claimed_at < ?3)
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(claim_cutoff(now, ttl))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn release(&self, id: &str) -> DbResult<()> {
        sqlx::query("UPDATE lotes SET processing = 0, claimed_at = NULL WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// `pending → submitted` with the authority's batch code. Releases the claim.
    pub async fn mark_submitted(
        &self,
        id: &str,
        batch_code: &str,
        authority_response: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE lotes
            SET status = 'submitted',
                batch_code = ?2,
                authority_response = ?3,
                submitted_at = ?4,
                updated_at = ?4,
                processing = 0,
                claimed_at = NULL
            WHERE id = ?1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(batch_code)
        .bind(authority_response)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.guard_failure(id, "pending").await);
        }
        info!(lote_id = %id, batch_code = %batch_code, "Lote submitted");
        Ok(())
    }

    /// Marks a lote failed and releases its undecided documents back to the
    /// backlog (`lote_id = NULL`). Returns how many documents were released.
    pub async fn mark_failed_and_release(
        &self,
        id: &str,
        reason: &str,
        authority_response: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE lotes
            SET status = 'failed',
                failure_reason = ?2,
                authority_response = COALESCE(?3, authority_response),
                updated_at = ?4,
                processing = 0,
                claimed_at = NULL
            WHERE id = ?1 AND status IN ('pending', 'submitted', 'processing')
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(authority_response)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            drop(tx);
            return Err(self.guard_failure(id, "pending, submitted or processing").await);
        }

        let released = sqlx::query(
            r#"
            UPDATE documents
            SET lote_id = NULL, updated_at = ?2
            WHERE lote_id = ?1 AND status = 'contingency_pending'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        info!(lote_id = %id, released, reason = %reason, "Lote failed, documents released");
        Ok(released)
    }

    /// Records a poll that found the lote still processing.
    pub async fn mark_polled(
        &self,
        id: &str,
        stale: bool,
        authority_response: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE lotes
            SET status = 'processing',
                last_polled_at = ?2,
                stale = (stale OR ?3),
                authority_response = COALESCE(?4, authority_response),
                updated_at = ?2
            WHERE id = ?1 AND status IN ('submitted', 'processing')
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(stale)
        .bind(authority_response)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.guard_failure(id, "submitted or processing").await);
        }
        debug!(lote_id = %id, stale, "Lote still processing");
        Ok(())
    }

    /// Applies per-document verdicts from a batch status query, then moves the
    /// lote to `completed` if every document now has a verdict, or to
    /// `processing` otherwise. One transaction.
    ///
    /// Verdicts for documents outside the lote, or already decided, are
    /// ignored.
    pub async fn apply_results(
        &self,
        id: &str,
        verdicts: &[AuthorityVerdict],
        stale: bool,
        authority_response: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<AppliedResults> {
        let mut tx = self.pool.begin().await?;
        let mut applied = 0usize;

        for verdict in verdicts {
            let fields = &verdict.fields;
            let result = sqlx::query(
                r#"
                UPDATE documents
                SET status = ?3,
                    authority_state = ?4,
                    received_seal = ?5,
                    processed_at = ?6,
                    message_code = ?7,
                    message_description = ?8,
                    observations = ?9,
                    updated_at = ?10
                WHERE lote_id = ?1
                  AND generation_code = ?2
                  AND status = 'contingency_pending'
                "#,
            )
            .bind(id)
            .bind(verdict.generation_code.to_uppercase())
            .bind(verdict.status())
            .bind(&fields.state)
            .bind(&fields.received_seal)
            .bind(fields.processed_at)
            .bind(&fields.message_code)
            .bind(&fields.message_description)
            .bind(encode_observations(&fields.observations))
            .bind(now)
            .execute(&mut *tx)
            .await?;

            applied += result.rows_affected() as usize;
        }

        let remaining: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM documents
            WHERE lote_id = ?1 AND status NOT IN ('accepted', 'rejected')
            "#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        let status = if remaining == 0 {
            LoteStatus::Completed
        } else {
            LoteStatus::Processing
        };

        let result = sqlx::query(
            r#"
            UPDATE lotes
            SET status = ?2,
                last_polled_at = ?3,
                completed_at = CASE WHEN ?2 = 'completed' THEN ?3 ELSE completed_at END,
                stale = CASE WHEN ?2 = 'completed' THEN stale ELSE (stale OR ?4) END,
                authority_response = COALESCE(?5, authority_response),
                updated_at = ?3
            WHERE id = ?1 AND status IN ('submitted', 'processing')
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(now)
        .bind(stale)
        .bind(authority_response)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            drop(tx);
            return Err(self.guard_failure(id, "submitted or processing").await);
        }

        tx.commit().await?;

        debug!(lote_id = %id, applied, remaining, status = %status, "Lote results applied");
        Ok(AppliedResults {
            applied,
            remaining,
            status,
        })
    }

    async fn guard_failure(&self, id: &str, expected: &str) -> DbError {
        match self.get_by_id(id).await {
            Ok(Some(_)) => DbError::precondition("Lote", id, expected),
            Ok(None) => DbError::not_found("Lote", id),
            Err(e) => e,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
