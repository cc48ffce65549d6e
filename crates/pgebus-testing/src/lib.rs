//! Shared test infrastructure for pgebus.
//!
//! Integration tests point `TEST_DATABASE_URL` at a PostgreSQL instance;
//! each test then works inside its own throwaway schema so the suite runs
//! concurrently against one database. Also provides a deterministic clock
//! and reusable handler probes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod database;
pub mod probes;
pub mod time;

pub use database::TestDb;
pub use probes::{wait_for_hits, wait_for_status, CountingHandler, FailingHandler};
pub use time::TestClock;

/// Initializes test logging from `RUST_LOG`, once per process.
///
/// Safe to call from every test; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
