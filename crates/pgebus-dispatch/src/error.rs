//! Error types for the dispatcher.
//!
//! Handler failures never appear here: they are captured, truncated and
//! stored on the event row, then answered with a retry or a dead-letter.
//! This taxonomy covers the dispatcher's own failures: startup
//! preconditions, storage trouble, and shutdown outcomes.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors surfaced by the dispatcher's public API and internals.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Startup precondition failed: schema missing, permission denied.
    /// The bus refuses to start.
    #[error("startup failed: {message}")]
    Startup {
        /// What precondition failed.
        message: String,
    },

    /// Transient database failure inside a worker iteration. Logged and
    /// backed off; never crashes the process.
    #[error("database error: {message}")]
    Database {
        /// Database error description.
        message: String,
    },

    /// `stop()` elapsed its timeout with work still in flight. Abandoned
    /// claims recover through the stale-lock sweep.
    #[error("shutdown timed out after {timeout:?} with work in flight")]
    ShutdownTimeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {message}")]
    WorkerPanic {
        /// Index of the panicked worker.
        worker_id: usize,
        /// Panic description from the join error.
        message: String,
    },

    /// `start()` called on a bus that is already running.
    #[error("event bus is already running")]
    AlreadyRunning,

    /// `stop()` called on a bus that was never started.
    #[error("event bus is not running")]
    NotRunning,
}

impl DispatchError {
    /// Creates a startup error.
    pub fn startup(message: impl Into<String>) -> Self {
        Self::Startup { message: message.into() }
    }

    /// Creates a transient database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Whether the failure is transient for the affected worker.
    ///
    /// Transient failures are logged and backed off; anything else is a
    /// caller error or a terminal lifecycle outcome.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database { .. })
    }
}

impl From<pgebus_core::CoreError> for DispatchError {
    fn from(err: pgebus_core::CoreError) -> Self {
        Self::Database { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(DispatchError::database("connection reset").is_transient());
        assert!(!DispatchError::startup("schema missing").is_transient());
        assert!(!DispatchError::ShutdownTimeout { timeout: Duration::from_secs(5) }.is_transient());
        assert!(!DispatchError::AlreadyRunning.is_transient());
    }

    #[test]
    fn core_errors_map_to_database() {
        let err: DispatchError = pgebus_core::CoreError::Database("boom".into()).into();
        assert!(matches!(err, DispatchError::Database { .. }));
    }
}
