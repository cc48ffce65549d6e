//! Lifecycle supervision for the event bus.
//!
//! `start()` verifies the database is usable, freezes the router, and
//! launches the listener, poller, stale sweeper and worker pool. `stop()`
//! drains in the opposite order, closing the listener connection last.

use std::{sync::Arc, time::Duration};

use pgebus_core::{Clock, EventSystemConfig, Storage, SystemClock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::{DispatchError, Result},
    listener::ChannelListener,
    poller::{Poller, StaleSweeper},
    retry::RetryPolicy,
    router::{Router, RouterMap},
    wake::WakeSignal,
    worker_pool::WorkerPool,
};

/// Runtime configuration of the dispatcher.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Push notification channel name.
    pub channel: String,

    /// Worker pool size.
    pub n_workers: usize,

    /// Fallback poll cadence.
    pub poll_interval: Duration,

    /// Age after which a running row is considered abandoned.
    pub stale_after: Duration,

    /// Cadence of the stale-lock sweep.
    pub stale_sweep_interval: Duration,

    /// Retry timing policy.
    pub retry: RetryPolicy,

    /// Whether to hold a LISTEN connection.
    pub listen_enabled: bool,

    /// Whether the stale-lock sweep runs.
    pub stale_recovery_enabled: bool,

    /// Worker pause after a transient storage failure.
    pub error_backoff: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::from(&EventSystemConfig::default())
    }
}

impl From<&EventSystemConfig> for BusConfig {
    fn from(config: &EventSystemConfig) -> Self {
        Self {
            channel: config.channel.clone(),
            n_workers: config.n_workers,
            poll_interval: config.poll_interval(),
            stale_after: config.stale_after(),
            stale_sweep_interval: config.stale_sweep_interval(),
            retry: RetryPolicy {
                base_delay: config.backoff_base(),
                max_delay: config.backoff_cap(),
                jitter_factor: config.jitter_factor,
            },
            listen_enabled: config.listen_enabled,
            stale_recovery_enabled: config.stale_recovery_enabled,
            error_backoff: Duration::from_secs(5),
        }
    }
}

struct Running {
    pool: WorkerPool,
    aux_shutdown: CancellationToken,
    aux_handles: Vec<JoinHandle<()>>,
    listener_shutdown: CancellationToken,
    listener_handle: Option<JoinHandle<()>>,
}

/// The event bus: claim protocol, worker pool and supervision.
///
/// ```no_run
/// # use pgebus_core::Storage;
/// # use pgebus_dispatch::{EventBus, BusConfig, Router};
/// # async fn example(storage: Storage, router: Router) -> anyhow::Result<()> {
/// let mut bus = EventBus::new(storage, BusConfig::default(), router);
/// bus.start().await?;
/// // ... produce and consume events ...
/// bus.stop(true, std::time::Duration::from_secs(30)).await?;
/// # Ok(())
/// # }
/// ```
pub struct EventBus {
    storage: Storage,
    config: BusConfig,
    router: Option<Router>,
    wake: WakeSignal,
    clock: Arc<dyn Clock>,
    running: Option<Running>,
}

impl EventBus {
    /// Creates a bus over the given storage, configuration and router.
    pub fn new(storage: Storage, config: BusConfig, router: Router) -> Self {
        Self::with_clock(storage, config, router, Arc::new(SystemClock))
    }

    /// Creates a bus with an injected clock, for deterministic tests.
    pub fn with_clock(
        storage: Storage,
        config: BusConfig,
        router: Router,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, config, router: Some(router), wake: WakeSignal::new(), clock, running: None }
    }

    /// The shared wake signal; exposed so embedders can force an
    /// immediate claim cycle.
    pub fn wake(&self) -> WakeSignal {
        self.wake.clone()
    }

    /// Starts the bus: verifies the schema, freezes the router, launches
    /// listener, poller, sweeper and workers.
    ///
    /// Tables are NOT created here; that is the operator's
    /// responsibility, and a missing events table refuses to start.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` on a second start, `Startup` when the
    /// schema cannot be ensured or the events table is missing.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(DispatchError::AlreadyRunning);
        }

        self.storage
            .ensure_schema()
            .await
            .map_err(|e| DispatchError::startup(format!("cannot ensure schema: {e}")))?;
        self.storage
            .verify_tables()
            .await
            .map_err(|e| DispatchError::startup(e.to_string()))?;

        let router: Arc<RouterMap> =
            Arc::new(self.router.take().map(Router::freeze).unwrap_or_default());

        info!(
            schema = self.storage.schema(),
            channel = %self.config.channel,
            n_workers = self.config.n_workers,
            routes = router.route_count(),
            "starting event bus"
        );

        let listener_shutdown = CancellationToken::new();
        let listener_handle = self.config.listen_enabled.then(|| {
            let listener = ChannelListener::new(
                self.storage.pool().clone(),
                self.config.channel.clone(),
                self.wake.clone(),
                listener_shutdown.clone(),
            );
            tokio::spawn(listener.run())
        });

        let aux_shutdown = CancellationToken::new();
        let mut aux_handles = Vec::new();

        let poller = Poller::new(
            self.config.poll_interval,
            self.wake.clone(),
            self.clock.clone(),
            aux_shutdown.clone(),
        );
        aux_handles.push(tokio::spawn(poller.run()));

        if self.config.stale_recovery_enabled {
            let sweeper = StaleSweeper::new(
                self.storage.clone(),
                self.config.stale_sweep_interval,
                self.config.stale_after,
                self.clock.clone(),
                self.wake.clone(),
                aux_shutdown.clone(),
            );
            aux_handles.push(tokio::spawn(sweeper.run()));
        }

        let pool = WorkerPool::spawn(
            &self.storage,
            &self.config,
            router,
            self.wake.clone(),
            self.clock.clone(),
        );

        self.running = Some(Running {
            pool,
            aux_shutdown,
            aux_handles,
            listener_shutdown,
            listener_handle,
        });

        info!("event bus started");
        Ok(())
    }

    /// Stops the bus.
    ///
    /// New claims stop immediately. With `wait_for_completion`, running
    /// dispatches may finish within `timeout`; otherwise they are
    /// cancelled cooperatively. The listener connection closes last.
    ///
    /// # Errors
    ///
    /// Returns `NotRunning` if the bus was never started, and
    /// `ShutdownTimeout` (a warning-level outcome) when work was still
    /// in flight at the deadline; affected rows recover through the
    /// stale-lock sweep.
    pub async fn stop(&mut self, wait_for_completion: bool, timeout: Duration) -> Result<()> {
        let running = self.running.take().ok_or(DispatchError::NotRunning)?;

        info!(wait_for_completion, timeout_s = timeout.as_secs(), "stopping event bus");

        running.aux_shutdown.cancel();
        for handle in running.aux_handles {
            if let Err(join_error) = handle.await {
                warn!(error = %join_error, "auxiliary task panicked during shutdown");
            }
        }

        let pool_result = running.pool.shutdown(wait_for_completion, timeout).await;

        running.listener_shutdown.cancel();
        if let Some(handle) = running.listener_handle {
            if let Err(join_error) = handle.await {
                warn!(error = %join_error, "listener task panicked during shutdown");
            }
        }

        match &pool_result {
            Ok(()) => info!("event bus stopped"),
            Err(error) => warn!(error = %error, "event bus stopped with work in flight"),
        }

        pool_result
    }

    /// Whether the bus is currently running.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            warn!("event bus dropped while running; cancelling tasks");
            running.aux_shutdown.cancel();
            running.listener_shutdown.cancel();
            drop(running.pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_config_mirrors_event_system_config() {
        let mut config = EventSystemConfig::default();
        config.n_workers = 3;
        config.poll_interval_seconds = 0.5;
        config.backoff_base_seconds = 1.0;
        config.listen_enabled = false;

        let bus_config = BusConfig::from(&config);
        assert_eq!(bus_config.n_workers, 3);
        assert_eq!(bus_config.poll_interval, Duration::from_millis(500));
        assert_eq!(bus_config.retry.base_delay, Duration::from_secs(1));
        assert!(!bus_config.listen_enabled);
        assert!(bus_config.stale_recovery_enabled);
    }

    #[tokio::test]
    async fn stop_before_start_is_rejected() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let storage = Storage::new(pool, "pgebus");
        let mut bus = EventBus::new(storage, BusConfig::default(), Router::new());

        let result = bus.stop(true, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DispatchError::NotRunning)));
    }
}
