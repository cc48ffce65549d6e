//! Periodic fallback poll and stale-lock sweep.
//!
//! The poller re-wakes the workers every interval so the bus makes
//! progress without any notification: delayed events whose `run_at` passes
//! while no producer is active, and events whose signal was lost, are both
//! picked up within one poll interval. The sweeper returns rows abandoned
//! by crashed workers to the queue.

use std::{sync::Arc, time::Duration};

use pgebus_core::{Clock, Storage};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::wake::WakeSignal;

/// Timer task emitting the shared wake every `poll_interval`.
pub(crate) struct Poller {
    interval: Duration,
    wake: WakeSignal,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl Poller {
    pub(crate) fn new(
        interval: Duration,
        wake: WakeSignal,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { interval, wake, clock, shutdown }
    }

    pub(crate) async fn run(self) {
        info!(interval_ms = self.interval.as_millis() as u64, "poller started");

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = self.clock.sleep(self.interval) => {
                    self.wake.wake_all();
                },
            }
        }

        info!("poller stopped");
    }
}

/// Periodic sweep returning abandoned running rows to the queue.
pub(crate) struct StaleSweeper {
    storage: Storage,
    interval: Duration,
    stale_after: Duration,
    clock: Arc<dyn Clock>,
    wake: WakeSignal,
    shutdown: CancellationToken,
}

impl StaleSweeper {
    pub(crate) fn new(
        storage: Storage,
        interval: Duration,
        stale_after: Duration,
        clock: Arc<dyn Clock>,
        wake: WakeSignal,
        shutdown: CancellationToken,
    ) -> Self {
        Self { storage, interval, stale_after, clock, wake, shutdown }
    }

    pub(crate) async fn run(self) {
        info!(
            interval_s = self.interval.as_secs(),
            stale_after_s = self.stale_after.as_secs(),
            "stale sweeper started"
        );

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = self.clock.sleep(self.interval) => {
                    match self
                        .storage
                        .events
                        .recover_stale(self.clock.now_utc(), self.stale_after)
                        .await
                    {
                        Ok(recovered) if !recovered.is_empty() => {
                            // Recovered rows are pending again; wake the pool.
                            self.wake.wake_all();
                        },
                        Ok(_) => {},
                        Err(error) => {
                            error!(error = %error, "stale sweep failed");
                        },
                    }
                },
            }
        }

        info!("stale sweeper stopped");
    }
}
