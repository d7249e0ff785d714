//! # Contingency Event Repository
//!
//! A period's notification to the authority. One row per period (UNIQUE
//! `period_id`); retries update the same row.
//!
//! ```text
//! pending ──accepted (RECIBIDO)──► accepted
//!    │
//!    ├──transient failure──► pending, attempts += 1  (retried by the sweep)
//!    └──definitive reject──► rejected                (needs an operator)
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use fiscal_core::{ContingencyEvent, EventStatus};

const EVENT_COLUMNS: &str = r#"
    id, period_id, generation_code, event_json, signed_event, status, attempts,
    authority_state, received_seal, authority_response, last_error,
    submitted_at, accepted_at, created_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: String,
    period_id: String,
    generation_code: String,
    event_json: String,
    signed_event: Option<String>,
    status: EventStatus,
    attempts: i64,
    authority_state: Option<String>,
    received_seal: Option<String>,
    authority_response: Option<String>,
    last_error: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
    accepted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<EventRow> for ContingencyEvent {
    fn from(row: EventRow) -> Self {
        ContingencyEvent {
            id: row.id,
            period_id: row.period_id,
            generation_code: row.generation_code,
            event_json: row.event_json,
            signed_event: row.signed_event,
            status: row.status,
            attempts: row.attempts,
            authority_state: row.authority_state,
            received_seal: row.received_seal,
            authority_response: row.authority_response,
            last_error: row.last_error,
            submitted_at: row.submitted_at,
            accepted_at: row.accepted_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub status: Option<EventStatus>,
    pub limit: Option<u32>,
}

/// Repository for contingency notifications.
#[derive(Debug, Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        EventRepository { pool }
    }

    /// Inserts the notification of a period.
    ///
    /// ## Errors
    /// `UniqueViolation` on `period_id` if the period already has one.
    pub async fn insert(&self, event: &ContingencyEvent) -> DbResult<()> {
        debug!(event_id = %event.id, period_id = %event.period_id, "Inserting contingency event");

        let result = sqlx::query(
            r#"
            INSERT INTO contingency_events (
                id, period_id, generation_code, event_json, signed_event, status, attempts,
                authority_state, received_seal, authority_response, last_error,
                submitted_at, accepted_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(&event.id)
        .bind(&event.period_id)
        .bind(&event.generation_code)
        .bind(&event.event_json)
        .bind(&event.signed_event)
        .bind(event.status)
        .bind(event.attempts)
        .bind(&event.authority_state)
        .bind(&event.received_seal)
        .bind(&event.authority_response)
        .bind(&event.last_error)
        .bind(event.submitted_at)
        .bind(event.accepted_at)
        .bind(event.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => match DbError::from(e) {
                DbError::UniqueViolation { .. } => Err(DbError::duplicate("period_id", &event.period_id)),
                other => Err(other),
            },
        }
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<ContingencyEvent>> {
        let sql = format!("SELECT {} FROM contingency_events WHERE id = ?1", EVENT_COLUMNS);
        let row: Option<EventRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn get_for_period(&self, period_id: &str) -> DbResult<Option<ContingencyEvent>> {
        let sql = format!(
            "SELECT {} FROM contingency_events WHERE period_id = ?1",
            EVENT_COLUMNS
        );
        let row: Option<EventRow> = sqlx::query_as(&sql)
            .bind(period_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    /// Stores the signed form of a pending event.
    pub async fn set_signed(&self, id: &str, signed_event: &str) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE contingency_events SET signed_event = ?2 WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id)
        .bind(signed_event)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::precondition("ContingencyEvent", id, "pending"));
        }
        Ok(())
    }

    /// Records a failed delivery attempt. The event stays pending.
    /// Returns the new attempt count.
    pub async fn record_attempt_failure(
        &self,
        id: &str,
        error: &str,
        authority_response: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<i64> {
        let attempts: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE contingency_events
            SET attempts = attempts + 1,
                last_error = ?2,
                authority_response = COALESCE(?3, authority_response),
                submitted_at = ?4
            WHERE id = ?1 AND status = 'pending'
            RETURNING attempts
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(authority_response)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        attempts.ok_or_else(|| DbError::precondition("ContingencyEvent", id, "pending"))
    }

    /// `pending → accepted`.
    pub async fn mark_accepted(
        &self,
        id: &str,
        authority_state: &str,
        received_seal: Option<&str>,
        authority_response: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE contingency_events
            SET status = 'accepted',
                attempts = attempts + 1,
                authority_state = ?2,
                received_seal = ?3,
                authority_response = ?4,
                last_error = NULL,
                submitted_at = ?5,
                accepted_at = ?5
            WHERE id = ?1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(authority_state)
        .bind(received_seal)
        .bind(authority_response)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::precondition("ContingencyEvent", id, "pending"));
        }
        Ok(())
    }

    /// `pending → rejected`. Rejected events are never retried automatically.
    pub async fn mark_rejected(
        &self,
        id: &str,
        authority_state: Option<&str>,
        authority_response: Option<&str>,
        error: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE contingency_events
            SET status = 'rejected',
                attempts = attempts + 1,
                authority_state = ?2,
                authority_response = ?3,
                last_error = ?4,
                submitted_at = ?5
            WHERE id = ?1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(authority_state)
        .bind(authority_response)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::precondition("ContingencyEvent", id, "pending"));
        }
        Ok(())
    }

    /// Lists events, newest first.
    pub async fn list(&self, filter: &EventFilter) -> DbResult<Vec<ContingencyEvent>> {
        let sql = format!(
            r#"
            SELECT {} FROM contingency_events
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY created_at DESC
            LIMIT ?2
            "#,
            EVENT_COLUMNS
        );
        let rows: Vec<EventRow> = sqlx::query_as(&sql)
            .bind(filter.status)
            .bind(filter.limit.map(i64::from).unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Pending events of reporting periods that still have attempts left.
    pub async fn list_pending_retryable(&self, max_attempts: u32) -> DbResult<Vec<ContingencyEvent>> {
        let sql = format!(
            r#"
            SELECT {} FROM contingency_events e
            WHERE e.status = 'pending'
              AND e.attempts < ?1
              AND EXISTS (
                  SELECT 1 FROM contingency_periods p
                  WHERE p.id = e.period_id AND p.status = 'reporting'
              )
            ORDER BY e.created_at
            "#,
            EVENT_COLUMNS
        );
        let rows: Vec<EventRow> = sqlx::query_as(&sql)
            .bind(i64::from(max_attempts))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
