//! Core domain models and strongly-typed identifiers.
//!
//! Defines the durable event row, its lifecycle status and the newtype
//! wrappers used across the bus. Includes database serialization traits and
//! the state transition rules the event store enforces.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed event identifier.
///
/// Wraps the `BIGSERIAL` primary key of the events table. Assignment is
/// monotonic within a database, which gives claims a stable tiebreak order
/// for rows sharing the same `run_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let id = <i64 as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Stable identity of a dispatcher worker.
///
/// Written into `locked_by` while a worker holds a claim, so operators can
/// attribute stuck rows to a process. The identity survives for the life of
/// the worker task, not the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    /// Creates a worker id from an explicit label.
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// Generates a worker id of the form `{host}-{index}-{uuid}`.
    ///
    /// The uuid suffix keeps ids unique across restarts so a stale
    /// `locked_by` never matches a live worker by accident.
    pub fn generate(index: usize) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
        Self(format!("{host}-{index}-{}", Uuid::new_v4().simple()))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event lifecycle status.
///
/// Transitions are strictly controlled by the event store:
///
/// ```text
/// pending --claim--> running --ok--> done
///                      |
///                      |--fail, attempts < max--> pending (run_at += backoff)
///                      |--fail, attempts = max--> dead
///                      `--stale recovery-------> pending
/// ```
///
/// `done` is terminal. `dead` is terminal absent operator intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting in the queue; becomes eligible once `run_at` has passed.
    Pending,

    /// Claimed by exactly one worker. `locked_at`/`locked_by` are set.
    Running,

    /// All handlers completed. Terminal.
    Done,

    /// Transiently failed; superseded by a reschedule back to pending.
    ///
    /// Present for operator tooling that parks rows manually; the
    /// dispatcher itself only produces `pending`, `running`, `done` and
    /// `dead`.
    Failed,

    /// Retry budget exhausted with the last attempt failing. Terminal.
    Dead,
}

impl EventStatus {
    /// Returns true for states the dispatcher will never transition out of.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Dead)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            _ => Err(format!("invalid event status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for EventStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for EventStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// A durable event row.
///
/// One row per logical event. The payload is an opaque JSON document the
/// bus never introspects; it should carry identifiers, not bulk data.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    /// Unique identifier, assigned by the database.
    pub id: EventId,

    /// Routing key, matched exactly against registered handler paths.
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub event_type: String,

    /// Opaque JSON payload.
    pub payload: Value,

    /// Current lifecycle status.
    pub status: EventStatus,

    /// Earliest time the event becomes eligible for a claim.
    pub run_at: DateTime<Utc>,

    /// Number of claims so far; incremented by every claim, saturating
    /// at `max_attempts` so a stale-recovered final attempt can re-run.
    pub attempts: i32,

    /// Retry budget for this row.
    pub max_attempts: i32,

    /// Truncated description of the most recent failure.
    pub last_error: Option<String>,

    /// When the row was inserted.
    pub created_at: DateTime<Utc>,

    /// When the row last changed.
    pub updated_at: DateTime<Utc>,

    /// Set while a worker holds the claim, null otherwise.
    pub locked_at: Option<DateTime<Utc>>,

    /// Identity of the claiming worker, null unless running.
    pub locked_by: Option<String>,
}

/// A new event about to be published.
///
/// Built by producers and handed to [`crate::publish::publish_event`] or
/// the event store. `run_at` defaults to the insertion time and
/// `max_attempts` to the table default when left unset.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Routing key. Must be non-empty.
    pub event_type: String,

    /// Opaque JSON payload.
    pub payload: Value,

    /// Optional delay: earliest eligible time, UTC.
    pub run_at: Option<DateTime<Utc>>,

    /// Optional per-event retry budget override.
    pub max_attempts: Option<i32>,
}

impl NewEvent {
    /// Creates a new event with the given type and payload.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self { event_type: event_type.into(), payload, run_at: None, max_attempts: None }
    }

    /// Schedules the event no earlier than `run_at`.
    #[must_use]
    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Overrides the retry budget for this event.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_round_trips() {
        for status in [
            EventStatus::Pending,
            EventStatus::Running,
            EventStatus::Done,
            EventStatus::Failed,
            EventStatus::Dead,
        ] {
            let parsed: EventStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn unknown_status_rejected() {
        assert!("delivering".parse::<EventStatus>().is_err());
        assert!("".parse::<EventStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(EventStatus::Done.is_terminal());
        assert!(EventStatus::Dead.is_terminal());
        assert!(!EventStatus::Pending.is_terminal());
        assert!(!EventStatus::Running.is_terminal());
    }

    #[test]
    fn worker_ids_are_unique() {
        let a = WorkerId::generate(0);
        let b = WorkerId::generate(0);
        assert_ne!(a, b);
    }

    #[test]
    fn new_event_builder_sets_overrides() {
        let run_at = Utc::now();
        let event = NewEvent::new("billing.invoice", serde_json::json!({"id": 7}))
            .run_at(run_at)
            .max_attempts(3);

        assert_eq!(event.event_type, "billing.invoice");
        assert_eq!(event.run_at, Some(run_at));
        assert_eq!(event.max_attempts, Some(3));
    }
}
