//! Deterministic clock for timing-sensitive tests.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use pgebus_core::Clock;

/// Test clock with manually controlled time.
///
/// `sleep` advances the clock by the requested duration and yields, so
/// backoff and poll logic runs instantly while still observing the time it
/// believes has passed.
#[derive(Clone)]
pub struct TestClock {
    now_micros: Arc<AtomicI64>,
}

impl TestClock {
    /// Creates a clock starting at the current wall time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a clock starting at a specific instant.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self { now_micros: Arc::new(AtomicI64::new(start.timestamp_micros())) }
    }

    /// Advances the clock.
    pub fn advance(&self, duration: Duration) {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        self.now_micros.fetch_add(micros, Ordering::AcqRel);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_utc(&self) -> DateTime<Utc> {
        let micros = self.now_micros.load(Ordering::Acquire);
        Utc.timestamp_micros(micros).single().unwrap_or_else(Utc::now)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
