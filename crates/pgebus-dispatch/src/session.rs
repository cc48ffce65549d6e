//! Capability-restricted database session for transactional handlers.
//!
//! The dispatcher is the sole authority over transaction boundaries: it
//! opens one transaction per event when any matched handler is
//! transactional, commits it after the last handler succeeds, and rolls it
//! back when any handler fails. Handlers therefore receive a wrapper whose
//! public surface can run queries but cannot commit, roll back, or take
//! the connection away: those operations are `pub(crate)` or absent, so
//! the seal is enforced by the type system rather than by convention.

use sqlx::{
    postgres::{PgArguments, PgQueryResult, PgRow},
    query::{Query, QueryAs, QueryScalar},
    PgConnection, PgPool, Postgres, Transaction,
};

use crate::error::{DispatchError, Result};

/// One dispatcher-managed transaction, shared by every handler of an
/// event.
///
/// Writes made through the session become visible only when the dispatch
/// succeeds and the dispatcher commits; any handler failure rolls the
/// whole event back.
pub struct EventSession {
    tx: Transaction<'static, Postgres>,
}

impl EventSession {
    /// Opens a session off the shared pool.
    pub(crate) async fn begin(pool: &PgPool) -> Result<Self> {
        let tx = pool
            .begin()
            .await
            .map_err(|e| DispatchError::database(format!("failed to open event session: {e}")))?;
        Ok(Self { tx })
    }

    /// Executes a statement, returning the affected-rows result.
    ///
    /// # Errors
    ///
    /// Propagates the underlying `sqlx` error.
    pub async fn execute(
        &mut self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> sqlx::Result<PgQueryResult> {
        query.execute(&mut *self.tx).await
    }

    /// Fetches exactly one row.
    ///
    /// # Errors
    ///
    /// Propagates the underlying `sqlx` error, including `RowNotFound`.
    pub async fn fetch_one(
        &mut self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> sqlx::Result<PgRow> {
        query.fetch_one(&mut *self.tx).await
    }

    /// Fetches at most one row.
    ///
    /// # Errors
    ///
    /// Propagates the underlying `sqlx` error.
    pub async fn fetch_optional(
        &mut self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> sqlx::Result<Option<PgRow>> {
        query.fetch_optional(&mut *self.tx).await
    }

    /// Fetches all rows.
    ///
    /// # Errors
    ///
    /// Propagates the underlying `sqlx` error.
    pub async fn fetch_all(
        &mut self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> sqlx::Result<Vec<PgRow>> {
        query.fetch_all(&mut *self.tx).await
    }

    /// Fetches exactly one row mapped to `T`.
    ///
    /// # Errors
    ///
    /// Propagates the underlying `sqlx` error.
    pub async fn fetch_one_as<T>(
        &mut self,
        query: QueryAs<'_, Postgres, T, PgArguments>,
    ) -> sqlx::Result<T>
    where
        T: for<'r> sqlx::FromRow<'r, PgRow> + Send + Unpin,
    {
        query.fetch_one(&mut *self.tx).await
    }

    /// Fetches all rows mapped to `T`.
    ///
    /// # Errors
    ///
    /// Propagates the underlying `sqlx` error.
    pub async fn fetch_all_as<T>(
        &mut self,
        query: QueryAs<'_, Postgres, T, PgArguments>,
    ) -> sqlx::Result<Vec<T>>
    where
        T: for<'r> sqlx::FromRow<'r, PgRow> + Send + Unpin,
    {
        query.fetch_all(&mut *self.tx).await
    }

    /// Fetches a single scalar value.
    ///
    /// # Errors
    ///
    /// Propagates the underlying `sqlx` error.
    pub async fn fetch_scalar<T>(
        &mut self,
        query: QueryScalar<'_, Postgres, T, PgArguments>,
    ) -> sqlx::Result<T>
    where
        T: Send + Unpin,
        (T,): for<'r> sqlx::FromRow<'r, PgRow>,
    {
        query.fetch_one(&mut *self.tx).await
    }

    /// Escape hatch: the raw connection under the transaction.
    ///
    /// Exists for queries the wrapper cannot express. Issuing
    /// transaction-control SQL (`COMMIT`, `ROLLBACK`, `SET TRANSACTION`)
    /// through it voids the transactional contract; the dispatcher will
    /// still attempt its own commit or rollback afterwards.
    pub fn unsafe_raw(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Commits the transaction. Dispatcher-only.
    pub(crate) async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| DispatchError::database(format!("failed to commit event session: {e}")))
    }

    /// Rolls the transaction back. Dispatcher-only.
    ///
    /// Dropping the session has the same effect; the explicit call exists
    /// so the failure path can log rollback errors.
    pub(crate) async fn rollback(self) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| DispatchError::database(format!("failed to roll back event session: {e}")))
    }
}

impl std::fmt::Debug for EventSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSession").finish_non_exhaustive()
    }
}
