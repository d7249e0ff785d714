//! # Contingency Period Repository
//!
//! ## Lifecycle and guards
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  insert_active ──► active ──begin_reporting──► reporting ──mark_closed──► closed
//! │       │             (WHERE status='active')      (WHERE status='reporting')
//! │       │                                                                 │
//! │       └── UNIQUE (scope) WHERE status='active'                         │
//! │           A second concurrent insert fails; find_or_create_active      │
//! │           re-reads and returns the winner.                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::claim_cutoff;
use crate::error::{DbError, DbResult};
use fiscal_core::{
    ContingencyCause, ContingencyPeriod, ContingencyType, Environment, PeriodStatus, Scope,
};

/// Lost races before giving up on find-or-create. Each loss means another
/// writer created the period, so the next read normally succeeds.
const CREATE_ATTEMPTS: usize = 5;

const PERIOD_COLUMNS: &str = r#"
    id, company_id, establishment_id, point_of_sale_id, environment,
    status, contingency_type, reason, started_at, closed_at,
    processing, claimed_at, created_at, updated_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct PeriodRow {
    id: String,
    company_id: String,
    establishment_id: String,
    point_of_sale_id: String,
    environment: Environment,
    status: PeriodStatus,
    contingency_type: i32,
    reason: Option<String>,
    started_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    processing: bool,
    claimed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PeriodRow {
    fn into_period(self) -> DbResult<ContingencyPeriod> {
        Ok(ContingencyPeriod {
            id: self.id,
            scope: Scope::new(
                self.company_id,
                self.establishment_id,
                self.point_of_sale_id,
                self.environment,
            ),
            status: self.status,
            contingency_type: ContingencyType::from_code(self.contingency_type)?,
            reason: self.reason,
            started_at: self.started_at,
            closed_at: self.closed_at,
            processing: self.processing,
            claimed_at: self.claimed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn rows_into_periods(rows: Vec<PeriodRow>) -> DbResult<Vec<ContingencyPeriod>> {
    rows.into_iter().map(PeriodRow::into_period).collect()
}

/// Filter for period listings. `from`/`to` bound `started_at`.
#[derive(Debug, Clone, Default)]
pub struct PeriodFilter {
    pub status: Option<PeriodStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Repository for contingency periods.
#[derive(Debug, Clone)]
pub struct PeriodRepository {
    pool: SqlitePool,
}

impl PeriodRepository {
    pub fn new(pool: SqlitePool) -> Self {
        PeriodRepository { pool }
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<ContingencyPeriod>> {
        let sql = format!("SELECT {} FROM contingency_periods WHERE id = ?1", PERIOD_COLUMNS);
        let row: Option<PeriodRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(PeriodRow::into_period).transpose()
    }

    /// The active period of a scope, if any.
    pub async fn find_active(&self, scope: &Scope) -> DbResult<Option<ContingencyPeriod>> {
        let sql = format!(
            r#"
            SELECT {} FROM contingency_periods
            WHERE company_id = ?1
              AND establishment_id = ?2
              AND point_of_sale_id = ?3
              AND environment = ?4
              AND status = 'active'
            "#,
            PERIOD_COLUMNS
        );
        let row: Option<PeriodRow> = sqlx::query_as(&sql)
            .bind(&scope.company_id)
            .bind(&scope.establishment_id)
            .bind(&scope.point_of_sale_id)
            .bind(scope.environment)
            .fetch_optional(&self.pool)
            .await?;

        row.map(PeriodRow::into_period).transpose()
    }

    /// Opens a new active period.
    ///
    /// ## Errors
    /// `UniqueViolation` if the scope already has an active period.
    pub async fn insert_active(
        &self,
        scope: &Scope,
        cause: &ContingencyCause,
        now: DateTime<Utc>,
    ) -> DbResult<ContingencyPeriod> {
        let reason = Some(cause.reason.trim().to_string()).filter(|r| !r.is_empty());
        let period = ContingencyPeriod {
            id: Uuid::new_v4().to_string(),
            scope: scope.clone(),
            status: PeriodStatus::Active,
            contingency_type: cause.contingency_type,
            reason,
            started_at: now,
            closed_at: None,
            processing: false,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO contingency_periods (
                id, company_id, establishment_id, point_of_sale_id, environment,
                status, contingency_type, reason, started_at, closed_at,
                processing, claimed_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7, ?8, NULL, 0, NULL, ?8, ?8)
            "#,
        )
        .bind(&period.id)
        .bind(&scope.company_id)
        .bind(&scope.establishment_id)
        .bind(&scope.point_of_sale_id)
        .bind(scope.environment)
        .bind(period.contingency_type.code())
        .bind(&period.reason)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(
            period_id = %period.id,
            scope = %scope,
            contingency_type = period.contingency_type.code(),
            "Contingency period opened"
        );
        Ok(period)
    }

    /// Returns the scope's active period, creating it if there is none.
    ///
    /// Concurrent callers race on the partial unique index; losers re-read
    /// and all of them end up with the same period.
    pub async fn find_or_create_active(
        &self,
        scope: &Scope,
        cause: &ContingencyCause,
        now: DateTime<Utc>,
    ) -> DbResult<ContingencyPeriod> {
        for _ in 0..CREATE_ATTEMPTS {
            if let Some(period) = self.find_active(scope).await? {
                return Ok(period);
            }

            match self.insert_active(scope, cause, now).await {
                Ok(period) => return Ok(period),
                Err(e) if e.is_unique_violation() => {
                    debug!(scope = %scope, "Lost period creation race, re-reading");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(DbError::QueryFailed(format!(
            "could not resolve an active contingency period for {}",
            scope
        )))
    }

    /// `active → reporting`, stamping `closed_at`. Returns the updated period.
    pub async fn begin_reporting(&self, id: &str, now: DateTime<Utc>) -> DbResult<ContingencyPeriod> {
        let result = sqlx::query(
            r#"
            UPDATE contingency_periods
            SET status = 'reporting', closed_at = ?2, updated_at = ?2
            WHERE id = ?1 AND status = 'active'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.guard_failure(id, "active").await);
        }

        self.get_by_id(id)
            .await?
            .ok_or_else(|| DbError::not_found("ContingencyPeriod", id))
    }

    /// `reporting → closed`.
    pub async fn mark_closed(&self, id: &str, now: DateTime<Utc>) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE contingency_periods
            SET status = 'closed', updated_at = ?2
            WHERE id = ?1 AND status = 'reporting'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.guard_failure(id, "reporting").await);
        }
        info!(period_id = %id, "Contingency period closed");
        Ok(())
    }

    /// Lists periods, newest first.
    pub async fn list(&self, filter: &PeriodFilter) -> DbResult<Vec<ContingencyPeriod>> {
        let sql = format!(
            r#"
            SELECT {} FROM contingency_periods
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR started_at >= ?2)
              AND (?3 IS NULL OR started_at <= ?3)
            ORDER BY started_at DESC
            LIMIT ?4
            "#,
            PERIOD_COLUMNS
        );
        let rows: Vec<PeriodRow> = sqlx::query_as(&sql)
            .bind(filter.status)
            .bind(filter.from)
            .bind(filter.to)
            .bind(filter.limit.map(i64::from).unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;

        rows_into_periods(rows)
    }

    /// Active periods opened before `cutoff`, oldest first.
    pub async fn list_active_older_than(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<ContingencyPeriod>> {
        let sql = format!(
            r#"
            SELECT {} FROM contingency_periods
            WHERE status = 'active' AND started_at < ?1
            ORDER BY started_at
            "#,
            PERIOD_COLUMNS
        );
        let rows: Vec<PeriodRow> = sqlx::query_as(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

        rows_into_periods(rows)
    }

    /// Closed periods that still hold documents outside any lote.
    pub async fn closed_with_unbatched(&self) -> DbResult<Vec<ContingencyPeriod>> {
        let sql = format!(
            r#"
            SELECT {} FROM contingency_periods p
            WHERE p.status = 'closed'
              AND EXISTS (
                  SELECT 1 FROM documents d
                  WHERE d.contingency_period_id = p.id
                    AND d.lote_id IS NULL
                    AND d.status = 'contingency_pending'
              )
            ORDER BY p.started_at
            "#,
            PERIOD_COLUMNS
        );
        let rows: Vec<PeriodRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        rows_into_periods(rows)
    }

    /// Reporting periods whose notification was rejected or ran out of
    /// attempts. These need an operator.
    pub async fn list_reporting_needing_attention(&self, max_attempts: u32) -> DbResult<Vec<ContingencyPeriod>> {
        let sql = format!(
            r#"
            SELECT {} FROM contingency_periods p
            WHERE p.status = 'reporting'
              AND EXISTS (
                  SELECT 1 FROM contingency_events e
                  WHERE e.period_id = p.id
                    AND (e.status = 'rejected' OR (e.status = 'pending' AND e.attempts >= ?1))
              )
            ORDER BY p.started_at
            "#,
            PERIOD_COLUMNS
        );
        let rows: Vec<PeriodRow> = sqlx::query_as(&sql)
            .bind(i64::from(max_attempts))
            .fetch_all(&self.pool)
            .await?;

        rows_into_periods(rows)
    }

    /// Reporting periods with no notification row (close interrupted between
    /// the status change and the event insert).
    pub async fn list_reporting_without_event(&self) -> DbResult<Vec<ContingencyPeriod>> {
        let sql = format!(
            r#"
            SELECT {} FROM contingency_periods p
            WHERE p.status = 'reporting'
              AND NOT EXISTS (SELECT 1 FROM contingency_events e WHERE e.period_id = p.id)
            ORDER BY p.started_at
            "#,
            PERIOD_COLUMNS
        );
        let rows: Vec<PeriodRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        rows_into_periods(rows)
    }

    /// Takes the sweep claim on a period. A claim older than `ttl` is treated
    /// as abandoned and can be taken over.
    pub async fn claim(&self, id: &str, now: DateTime<Utc>, ttl: Duration) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE contingency_periods
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
        sqlx::query("UPDATE contingency_periods SET processing = 0, claimed_at = NULL WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn guard_failure(&self, id: &str, expected: &str) -> DbError {
        match self.get_by_id(id).await {
            Ok(Some(_)) => DbError::precondition("ContingencyPeriod", id, expected),
            Ok(None) => DbError::not_found("ContingencyPeriod", id),
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
    use crate::repository::test_support::{db, scope};

    fn cause() -> ContingencyCause {
        ContingencyCause::new(ContingencyType::AuthorityUnavailable, "authority timeout")
    }

    #[tokio::test]
    async fn test_one_active_period_per_scope() {
        let db = db().await;
        let repo = db.periods();

        let first = repo.find_or_create_active(&scope(), &cause(), Utc::now()).await.unwrap();
        let second = repo.find_or_create_active(&scope(), &cause(), Utc::now()).await.unwrap();
        assert_eq!(first.id, second.id);

        let err = repo.insert_active(&scope(), &cause(), Utc::now()).await.unwrap_err();
        assert!(err.is_unique_violation());

        let mut other = scope();
        other.environment = Environment::Production;
        let third = repo.find_or_create_active(&other, &cause(), Utc::now()).await.unwrap();
        assert_ne!(first.id, third.id);
    }

    #[tokio::test]
    async fn test_lifecycle_guards() {
        let db = db().await;
        let repo = db.periods();
        let period = repo.find_or_create_active(&scope(), &cause(), Utc::now()).await.unwrap();

        assert!(repo.mark_closed(&period.id, Utc::now()).await.unwrap_err().is_precondition_failed());

        let reporting = repo.begin_reporting(&period.id, Utc::now()).await.unwrap();
        assert_eq!(reporting.status, PeriodStatus::Reporting);
        assert!(reporting.closed_at.is_some());
        assert!(repo
            .begin_reporting(&period.id, Utc::now())
            .await
            .unwrap_err()
            .is_precondition_failed());

        // A new outage after close opens a fresh period
        let next = repo.find_or_create_active(&scope(), &cause(), Utc::now()).await.unwrap();
        assert_ne!(next.id, period.id);

        repo.mark_closed(&period.id, Utc::now()).await.unwrap();
        let closed = repo.get_by_id(&period.id).await.unwrap().unwrap();
        assert_eq!(closed.status, PeriodStatus::Closed);
        assert_eq!(closed.reason.as_deref(), Some("authority timeout"));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let db = db().await;
        let repo = db.periods();
        let a = repo.find_or_create_active(&scope(), &cause(), Utc::now()).await.unwrap();
        repo.begin_reporting(&a.id, Utc::now()).await.unwrap();
        repo.find_or_create_active(&scope(), &cause(), Utc::now()).await.unwrap();

        let all = repo.list(&PeriodFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let reporting = repo
            .list(&PeriodFilter {
                status: Some(PeriodStatus::Reporting),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(reporting.len(), 1);
        assert_eq!(reporting[0].id, a.id);

        let limited = repo
            .list(&PeriodFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        assert_eq!(repo.list_reporting_without_event().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claims_expire() {
        let db = db().await;
        let repo = db.periods();
        let period = repo.find_or_create_active(&scope(), &cause(), Utc::now()).await.unwrap();
        let ttl = Duration::from_secs(300);
        let now = Utc::now();

        assert!(repo.claim(&period.id, now, ttl).await.unwrap());
        assert!(!repo.claim(&period.id, now, ttl).await.unwrap());

        let later = now + chrono::Duration::seconds(301);
        assert!(repo.claim(&period.id, later, ttl).await.unwrap());

        repo.release(&period.id).await.unwrap();
        assert!(repo.claim(&period.id, later, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_active_periods() {
        let db = db().await;
        let repo = db.periods();
        let started = Utc::now() - chrono::Duration::hours(30);
        let period = repo.find_or_create_active(&scope(), &cause(), started).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let expired = repo.list_active_older_than(cutoff).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, period.id);

        let recent_cutoff = Utc::now() - chrono::Duration::hours(48);
        assert!(repo.list_active_older_than(recent_cutoff).await.unwrap().is_empty());
    }
}
