//! Repository for event row operations.
//!
//! Implements the claim protocol and all status transitions. Claims use
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never block on each other
//! and never observe the same row. Every operation commits before
//! returning: a claim survives a worker crash, and an un-finished claim is
//! returned to the queue by the stale-lock sweep rather than by rollback.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};
use tracing::{debug, warn};

use crate::{
    error::{CoreError, Result},
    models::{Event, EventId, EventStatus, NewEvent, WorkerId},
};

/// Maximum stored length of a failure description, in bytes.
pub const LAST_ERROR_MAX_BYTES: usize = 2048;

const EVENT_COLUMNS: &str = "id, type, payload, status, run_at, attempts, max_attempts, \
                             last_error, created_at, updated_at, locked_at, locked_by";

/// Repository for event rows in a single schema.
pub struct Repository {
    pool: Arc<PgPool>,
    schema: String,
    default_max_attempts: i32,
}

impl Repository {
    /// Creates a new repository over the given pool and schema, with the
    /// standard retry budget of 5 for events that do not override it.
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self::with_default_max_attempts(pool, schema, 5)
    }

    /// Creates a repository whose inserts default to the given retry
    /// budget (the `event_system.max_attempts` configuration option).
    pub fn with_default_max_attempts(
        pool: PgPool,
        schema: impl Into<String>,
        default_max_attempts: i32,
    ) -> Self {
        Self { pool: Arc::new(pool), schema: schema.into(), default_max_attempts }
    }

    fn table(&self) -> String {
        format!(r#""{}".events"#, self.schema)
    }

    /// Inserts a new pending event and commits.
    ///
    /// The row becomes visible to workers immediately. Producers that need
    /// the insert tied to their own transaction use [`Self::insert_pending_in_tx`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an empty event type.
    pub async fn insert_pending(&self, event: &NewEvent) -> Result<EventId> {
        self.insert_pending_impl(&*self.pool, event).await
    }

    /// Inserts a new pending event within the caller's transaction.
    ///
    /// The row is invisible to workers until the caller commits.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an empty event type.
    pub async fn insert_pending_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &NewEvent,
    ) -> Result<EventId> {
        self.insert_pending_impl(&mut **tx, event).await
    }

    async fn insert_pending_impl<'e, E>(&self, executor: E, event: &NewEvent) -> Result<EventId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        insert_pending_with(executor, &self.schema, event, self.default_max_attempts).await
    }

    /// Claims the single oldest eligible pending event for `worker`.
    ///
    /// Eligible means `status = 'pending'` and `run_at <= now`, ordered by
    /// `(run_at, id)`. `FOR UPDATE SKIP LOCKED` lets concurrent claimers
    /// pass over rows another transaction holds, so each caller receives a
    /// distinct row or none. The claim transaction commits before
    /// returning, making the claim durable even if the worker crashes
    /// immediately after.
    ///
    /// The attempt counter saturates at `max_attempts`: a claim that
    /// crashed on the final attempt and was returned to the queue by
    /// stale recovery re-runs without pushing the counter past the
    /// budget.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the claim transaction fails.
    pub async fn claim_one(&self, worker: &WorkerId, now: DateTime<Utc>) -> Result<Option<Event>> {
        let mut tx = self.pool.begin().await?;

        let claimed: Option<i64> = sqlx::query_scalar(&format!(
            r#"
            SELECT id FROM {table}
            WHERE status = 'pending' AND run_at <= $1
            ORDER BY run_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
            table = self.table(),
        ))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = claimed else {
            tx.rollback().await?;
            return Ok(None);
        };

        let event = sqlx::query_as::<_, Event>(&format!(
            r#"
            UPDATE {table}
            SET status = 'running',
                locked_at = $1,
                locked_by = $2,
                attempts = LEAST(attempts + 1, max_attempts),
                updated_at = $1
            WHERE id = $3
            RETURNING {EVENT_COLUMNS}
            "#,
            table = self.table(),
        ))
        .bind(now)
        .bind(worker.as_str())
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(event_id = %event.id, event_type = %event.event_type, worker_id = %worker,
               attempt = event.attempts, "claimed event");

        Ok(Some(event))
    }

    /// Marks a running event as done and commits. Terminal.
    ///
    /// Clears `locked_at`/`locked_by`. A row not in `running` is left
    /// untouched and logged: it was already recovered or finished by the
    /// stale sweep racing this worker.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the update fails.
    pub async fn mark_done(&self, id: EventId) -> Result<()> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET status = 'done', locked_at = NULL, locked_by = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
            table = self.table(),
        ))
        .bind(id)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(event_id = %id, "mark_done found no running row; claim was likely recovered");
        }

        Ok(())
    }

    /// Records a failed attempt on a running event and commits.
    ///
    /// When the retry budget remains, the row returns to `pending` with
    /// `run_at = now + backoff`; otherwise it becomes `dead`. Either way
    /// locks are cleared and the error stored, truncated to
    /// [`LAST_ERROR_MAX_BYTES`]. Returns the resulting status, or `None`
    /// when the row was not running.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the update fails.
    pub async fn mark_failed(
        &self,
        id: EventId,
        error: &str,
        now: DateTime<Utc>,
        backoff: Duration,
    ) -> Result<Option<EventStatus>> {
        let run_at =
            now + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::days(365));

        let status: Option<EventStatus> = sqlx::query_scalar(&format!(
            r#"
            UPDATE {table}
            SET status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'dead' END,
                run_at = CASE WHEN attempts < max_attempts THEN $2 ELSE run_at END,
                last_error = $3,
                locked_at = NULL,
                locked_by = NULL,
                updated_at = $1
            WHERE id = $4 AND status = 'running'
            RETURNING status
            "#,
            table = self.table(),
        ))
        .bind(now)
        .bind(run_at)
        .bind(truncate_error(error))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        if status.is_none() {
            warn!(event_id = %id, "mark_failed found no running row; claim was likely recovered");
        }

        Ok(status)
    }

    /// Returns abandoned running rows to the queue.
    ///
    /// Any row locked earlier than `now - stale_after` goes back to
    /// `pending` with `last_error = 'stale lock recovered'`. Attempts are
    /// not incremented: the crashed claim already counted one. Returns the
    /// recovered ids.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the sweep fails.
    pub async fn recover_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Vec<EventId>> {
        let cutoff = now
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::days(365));

        let ids: Vec<EventId> = sqlx::query_scalar(&format!(
            r#"
            UPDATE {table}
            SET status = 'pending',
                locked_at = NULL,
                locked_by = NULL,
                last_error = 'stale lock recovered',
                updated_at = $1
            WHERE status = 'running' AND locked_at < $2
            RETURNING id
            "#,
            table = self.table(),
        ))
        .bind(now)
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await?;

        if !ids.is_empty() {
            warn!(recovered = ids.len(), "recovered stale event locks");
        }

        Ok(ids)
    }

    /// Fetches an event by id.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the query fails.
    pub async fn find_by_id(&self, id: EventId) -> Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>(&format!(
            "SELECT {EVENT_COLUMNS} FROM {table} WHERE id = $1",
            table = self.table(),
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Counts events in the given status.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the query fails.
    pub async fn count_by_status(&self, status: EventStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {table} WHERE status = $1",
            table = self.table(),
        ))
        .bind(status)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count)
    }
}

/// Inserts a pending event row through an arbitrary executor.
///
/// Shared by the repository and the producer-side publish helper, which
/// runs inside a caller-owned transaction and therefore has no repository
/// at hand.
///
/// # Errors
///
/// Returns `InvalidInput` for an empty event type.
pub(crate) async fn insert_pending_with<'e, E>(
    executor: E,
    schema: &str,
    event: &NewEvent,
    default_max_attempts: i32,
) -> Result<EventId>
where
    E: Executor<'e, Database = Postgres>,
{
    if event.event_type.is_empty() {
        return Err(CoreError::InvalidInput("event type must not be empty".into()));
    }

    let id: i64 = sqlx::query_scalar(&format!(
        r#"
        INSERT INTO "{schema}".events (type, payload, status, run_at, max_attempts)
        VALUES ($1, $2, 'pending', COALESCE($3, NOW()), $4)
        RETURNING id
        "#,
    ))
    .bind(&event.event_type)
    .bind(&event.payload)
    .bind(event.run_at)
    .bind(event.max_attempts.unwrap_or(default_max_attempts))
    .fetch_one(executor)
    .await?;

    Ok(EventId(id))
}

/// Truncates a failure description to [`LAST_ERROR_MAX_BYTES`] on a char
/// boundary.
pub fn truncate_error(error: &str) -> &str {
    if error.len() <= LAST_ERROR_MAX_BYTES {
        return error;
    }
    let mut end = LAST_ERROR_MAX_BYTES;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    &error[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_errors_kept_verbatim() {
        assert_eq!(truncate_error("boom"), "boom");
        assert_eq!(truncate_error(""), "");
    }

    #[test]
    fn long_errors_truncated_to_cap() {
        let long = "x".repeat(LAST_ERROR_MAX_BYTES * 2);
        assert_eq!(truncate_error(&long).len(), LAST_ERROR_MAX_BYTES);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // Multi-byte characters straddling the cap must not split.
        let long = "é".repeat(LAST_ERROR_MAX_BYTES);
        let truncated = truncate_error(&long);
        assert!(truncated.len() <= LAST_ERROR_MAX_BYTES);
        assert!(long.starts_with(truncated));
    }
}
