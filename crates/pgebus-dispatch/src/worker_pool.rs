//! Worker pool lifecycle: spawn, supervise, drain.

use std::{sync::Arc, time::Duration};

use pgebus_core::{Clock, Storage, WorkerId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    bus::BusConfig,
    error::{DispatchError, Result},
    router::RouterMap,
    wake::WakeSignal,
    worker::Worker,
};

/// Pool of dispatcher workers sharing one wake signal.
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    /// Stops new claims.
    shutdown: CancellationToken,
    /// Drops in-flight dispatches when a stop does not wait.
    inflight: CancellationToken,
}

impl WorkerPool {
    /// Spawns `config.n_workers` workers.
    pub(crate) fn spawn(
        storage: &Storage,
        config: &BusConfig,
        router: Arc<RouterMap>,
        wake: WakeSignal,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let inflight = CancellationToken::new();

        let handles = (0..config.n_workers)
            .map(|index| {
                let worker = Worker::new(
                    WorkerId::generate(index),
                    storage.clone(),
                    router.clone(),
                    config.retry.clone(),
                    config.channel.clone(),
                    wake.clone(),
                    clock.clone(),
                    shutdown.clone(),
                    inflight.clone(),
                    config.error_backoff,
                );
                tokio::spawn(worker.run())
            })
            .collect::<Vec<_>>();

        info!(n_workers = handles.len(), "worker pool spawned");

        Self { handles, shutdown, inflight }
    }

    /// Stops the pool.
    ///
    /// Claims stop immediately. With `wait_for_completion`, in-flight
    /// dispatches may finish within `timeout`; otherwise they are
    /// cancelled cooperatively and their rows recover through the
    /// stale-lock sweep.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` when workers were still busy at the
    /// deadline.
    pub(crate) async fn shutdown(
        mut self,
        wait_for_completion: bool,
        timeout: Duration,
    ) -> Result<()> {
        info!(
            wait_for_completion,
            timeout_s = timeout.as_secs(),
            workers = self.handles.len(),
            "stopping worker pool"
        );

        self.shutdown.cancel();
        if !wait_for_completion {
            self.inflight.cancel();
        }

        let handles = std::mem::take(&mut self.handles);
        let join_all = async {
            for (index, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(worker_id = index, error = %join_error, "worker task panicked");
                }
            }
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                info!("worker pool stopped");
                Ok(())
            },
            Err(_) => {
                // Abandoned claims become stale locks and are recovered by
                // the sweep; the caller treats this as a warning.
                warn!(timeout_s = timeout.as_secs(), "worker pool shutdown timed out");
                self.inflight.cancel();
                Err(DispatchError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.is_empty() && !self.shutdown.is_cancelled() {
            warn!(
                workers = self.handles.len(),
                "worker pool dropped without shutdown; cancelling workers"
            );
            self.shutdown.cancel();
            self.inflight.cancel();
        }
    }
}
