//! Database access layer for the events table.
//!
//! All event mutations go through the repository here; the dispatcher never
//! issues raw SQL against the events table from anywhere else. The
//! repository commits every state transition so a worker crash can lose at
//! most the work of the in-flight handler, never a bookkeeping update.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

pub mod events;

use crate::{
    config::Config,
    error::{CoreError, Result},
    models::{EventId, NewEvent},
    publish,
};

/// Entry point for all database operations.
///
/// Owns the shared connection pool and the schema name the events table
/// lives in. Cheap to clone.
#[derive(Clone)]
pub struct Storage {
    /// Repository for event rows.
    pub events: Arc<events::Repository>,
    pool: PgPool,
    schema: String,
}

impl Storage {
    /// Creates a storage instance over the given pool and schema, with the
    /// standard retry budget of 5.
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self::with_default_max_attempts(pool, schema, 5)
    }

    /// Creates a storage instance whose inserts default to the given retry
    /// budget.
    pub fn with_default_max_attempts(
        pool: PgPool,
        schema: impl Into<String>,
        default_max_attempts: i32,
    ) -> Self {
        let schema = schema.into();
        Self {
            events: Arc::new(events::Repository::with_default_max_attempts(
                pool.clone(),
                schema.clone(),
                default_max_attempts,
            )),
            pool,
            schema,
        }
    }

    /// Creates a storage instance from loaded configuration: schema from
    /// `database.schema`, retry budget from `event_system.max_attempts`.
    pub fn from_config(pool: PgPool, config: &Config) -> Self {
        Self::with_default_max_attempts(
            pool,
            config.database.schema.clone(),
            config.event_system.max_attempts,
        )
    }

    /// Returns the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Returns the schema the events table lives in.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Verifies database connectivity with a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    /// Creates the schema if it does not exist.
    ///
    /// Called by the lifecycle supervisor on start. Tables are the
    /// operator's responsibility and are NOT created here.
    ///
    /// # Errors
    ///
    /// Returns `Database` on permission failure; the bus refuses to start.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(&format!(r#"CREATE SCHEMA IF NOT EXISTS "{}""#, self.schema))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Verifies the events table exists in the configured schema.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the table is missing, the fatal
    /// refuse-to-start condition.
    pub async fn verify_tables(&self) -> Result<()> {
        let table = format!("{}.events", self.schema);
        let exists: Option<String> =
            sqlx::query_scalar("SELECT to_regclass($1)::text").bind(&table).fetch_one(&self.pool).await?;

        if exists.is_none() {
            return Err(CoreError::NotFound(format!(
                "table {table} does not exist; run the schema setup before starting the bus"
            )));
        }
        Ok(())
    }

    /// Creates the events table and its indexes if absent.
    ///
    /// Operator and test tooling only; `start()` never calls this.
    ///
    /// # Errors
    ///
    /// Returns `Database` if DDL fails.
    pub async fn create_tables(&self) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{schema}".events (
                id BIGSERIAL PRIMARY KEY,
                type TEXT NOT NULL,
                payload JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                status TEXT NOT NULL DEFAULT 'pending',
                run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 5,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                locked_at TIMESTAMPTZ,
                locked_by TEXT,
                CHECK (type <> ''),
                CHECK (max_attempts > 0),
                CHECK (attempts >= 0 AND attempts <= max_attempts)
            )
            "#,
            schema = self.schema,
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE INDEX IF NOT EXISTS events_claim_idx
            ON "{schema}".events (status, run_at, id)
            "#,
            schema = self.schema,
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE INDEX IF NOT EXISTS events_stale_idx
            ON "{schema}".events (status, locked_at)
            "#,
            schema = self.schema,
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Publishes an event in its own transaction and commits.
    ///
    /// Convenience for producers without a surrounding transaction; the
    /// notification goes out with the commit exactly as with
    /// [`publish::publish_event`]. Unlike the free helper, the insert goes
    /// through the repository, so the configured retry budget applies to
    /// events that do not override it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an empty type, `Database` on failure.
    pub async fn publish(&self, event: &NewEvent, channel: &str) -> Result<EventId> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;
        let id = self.events.insert_pending_in_tx(&mut tx, event).await?;
        publish::notify_channel(&mut *tx, channel).await?;
        tx.commit().await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        let pool = PgPool::connect_lazy("postgresql://test").unwrap();
        let storage = Storage::new(pool, "pgebus");
        assert_eq!(storage.schema(), "pgebus");
    }
}
