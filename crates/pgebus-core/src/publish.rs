//! Producer surface: insert an event and signal the workers.
//!
//! The notification is issued inside the producer's transaction, so workers
//! are woken iff the insert commits. Notifications are an optimization
//! only: the dispatcher's poller guarantees progress when every signal is
//! lost.

use sqlx::{Executor, Postgres, Transaction};
use tracing::debug;

use crate::{
    error::Result,
    models::{EventId, NewEvent},
    storage::events,
};

/// Inserts a pending event and notifies `channel` in the same transaction.
///
/// Does NOT commit: the caller owns the transaction, and the row stays
/// invisible to workers until that commit. The notification payload is
/// empty; its only purpose is to wake listeners.
///
/// Events that do not set [`NewEvent::max_attempts`] get the data model's
/// default budget of 5. Producers that want the configured
/// `event_system.max_attempts` applied go through
/// [`crate::storage::Storage::publish`] or set the budget explicitly.
///
/// # Errors
///
/// Returns `InvalidInput` for an empty event type, `Database` on failure.
pub async fn publish_event(
    tx: &mut Transaction<'_, Postgres>,
    schema: &str,
    channel: &str,
    event: &NewEvent,
) -> Result<EventId> {
    let id = events::insert_pending_with(&mut **tx, schema, event, 5).await?;

    notify_channel(&mut **tx, channel).await?;

    debug!(event_id = %id, event_type = %event.event_type, channel, "published event");

    Ok(id)
}

/// Sends a payload-less wake signal on `channel`.
///
/// Used by producers (within their transaction) and by workers after
/// rescheduling a retry.
///
/// # Errors
///
/// Returns `Database` if the notify fails.
pub async fn notify_channel<'e, E>(executor: E, channel: &str) -> Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("SELECT pg_notify($1, '')").bind(channel).execute(executor).await?;
    Ok(())
}
