//! Error types and result handling for event store operations.
//!
//! Maps database failures into a small taxonomy the dispatcher can act on:
//! bad producer input is surfaced synchronously, transient storage trouble
//! is retried or left to stale recovery, and nothing here ever carries a
//! user handler's error (those live in the row's `last_error`).

use thiserror::Error;

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for event store and producer operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed producer call; never reaches the queue.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),
}

impl CoreError {
    /// Whether the failure is transient and worth retrying at the caller.
    ///
    /// Input and constraint errors will fail identically on a retry;
    /// connectivity and serialization failures may not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested row not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(CoreError::Database("connection reset".into()).is_transient());
        assert!(!CoreError::InvalidInput("empty type".into()).is_transient());
        assert!(!CoreError::NotFound("event 9".into()).is_transient());
        assert!(!CoreError::ConstraintViolation("dup".into()).is_transient());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
