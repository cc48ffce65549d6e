//! Worker loop: wait, claim, dispatch, record.
//!
//! Each worker parks on the shared wake signal, then drains the queue one
//! claim at a time until empty. A claimed event is dispatched to its
//! handlers under the transactional policy, and the outcome is recorded
//! through the event store. Nothing that happens inside a handler or a
//! single iteration can take the worker down: storage trouble is logged
//! and backed off, and an unrecorded outcome is repaired by the
//! stale-lock sweep.

use std::{sync::Arc, time::Duration};

use pgebus_core::{notify_channel, Clock, Event, EventStatus, Storage, WorkerId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    context::EventContext,
    retry::RetryPolicy,
    router::RouterMap,
    session::EventSession,
    wake::WakeSignal,
};

/// A single dispatcher worker.
pub(crate) struct Worker {
    worker_id: WorkerId,
    storage: Storage,
    router: Arc<RouterMap>,
    retry: RetryPolicy,
    channel: String,
    wake: WakeSignal,
    clock: Arc<dyn Clock>,
    /// Stops new claims; checked between events.
    shutdown: CancellationToken,
    /// Drops in-flight dispatches; only cancelled by a non-waiting stop.
    inflight: CancellationToken,
    /// Pause after a transient storage failure before claiming again.
    error_backoff: Duration,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        worker_id: WorkerId,
        storage: Storage,
        router: Arc<RouterMap>,
        retry: RetryPolicy,
        channel: String,
        wake: WakeSignal,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
        inflight: CancellationToken,
        error_backoff: Duration,
    ) -> Self {
        Self {
            worker_id,
            storage,
            router,
            retry,
            channel,
            wake,
            clock,
            shutdown,
            inflight,
            error_backoff,
        }
    }

    /// Main loop: runs until the shutdown token is cancelled.
    pub(crate) async fn run(self) {
        info!(worker_id = %self.worker_id, "worker started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            self.drain().await;

            tokio::select! {
                () = self.wake.wait() => {},
                () = self.shutdown.cancelled() => break,
            }
        }

        info!(worker_id = %self.worker_id, "worker stopped");
    }

    /// Claims and dispatches until the queue is empty.
    ///
    /// Bursts are drained without re-parking; only a `None` claim (or
    /// shutdown, or a transient storage failure) returns to the wait.
    async fn drain(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            match self.storage.events.claim_one(&self.worker_id, self.clock.now_utc()).await {
                Ok(Some(event)) => {
                    let event_id = event.id;
                    tokio::select! {
                        () = self.dispatch(event) => {},
                        () = self.inflight.cancelled() => {
                            warn!(worker_id = %self.worker_id, event_id = %event_id,
                                  "dispatch cancelled mid-flight; row left to stale recovery");
                            return;
                        },
                    }
                },
                Ok(None) => return,
                Err(error) => {
                    error!(worker_id = %self.worker_id, error = %error,
                           "claim failed, backing off");
                    tokio::select! {
                        () = self.clock.sleep(self.error_backoff) => {},
                        () = self.shutdown.cancelled() => {},
                    }
                    return;
                },
            }
        }
    }

    /// Runs the handlers for one claimed event and records the outcome.
    async fn dispatch(&self, event: Event) {
        let handlers = self.router.matches(&event.event_type);

        if handlers.is_empty() {
            // Explicit no-op success: stray event types must not pile up
            // as dead rows.
            debug!(event_id = %event.id, event_type = %event.event_type,
                   "no handlers registered, marking done");
            if let Err(error) = self.storage.events.mark_done(event.id).await {
                error!(event_id = %event.id, error = %error,
                       "failed to mark unrouted event done; stale recovery will repair");
            }
            return;
        }

        let transactional = handlers.iter().any(|entry| entry.transactional);

        let session = if transactional {
            match EventSession::begin(self.storage.pool()).await {
                Ok(session) => Some(session),
                Err(error) => {
                    // Transient storage trouble: leave the claim to the
                    // stale sweep rather than burn an attempt.
                    error!(event_id = %event.id, error = %error,
                           "failed to open event session; leaving claim to stale recovery");
                    return;
                },
            }
        } else {
            None
        };

        debug!(worker_id = %self.worker_id, event_id = %event.id,
               event_type = %event.event_type, attempt = event.attempts,
               transactional, handlers = handlers.len(), "dispatching event");

        let mut ctx = EventContext::new(event.id, &event.event_type, event.attempts, session);
        let mut failure: Option<anyhow::Error> = None;

        for entry in handlers {
            if let Err(error) = entry.call(&mut ctx, &event.payload).await {
                warn!(event_id = %event.id, path = %entry.path, error = %error,
                      "handler failed, aborting remaining handlers");
                failure = Some(error);
                break;
            }
        }

        match failure {
            None => {
                if let Some(session) = ctx.take_session() {
                    if let Err(error) = session.commit().await {
                        // A failed commit is a failed dispatch: none of the
                        // handlers' writes survived.
                        self.record_failure(&event, &format!("commit failed: {error}")).await;
                        return;
                    }
                }

                if let Err(error) = self.storage.events.mark_done(event.id).await {
                    error!(event_id = %event.id, error = %error,
                           "failed to mark event done; stale recovery will re-run handlers");
                    return;
                }

                debug!(worker_id = %self.worker_id, event_id = %event.id,
                       attempt = event.attempts, "event done");
            },
            Some(error) => {
                if let Some(session) = ctx.take_session() {
                    if let Err(rollback_error) = session.rollback().await {
                        warn!(event_id = %event.id, error = %rollback_error,
                              "failed to roll back event session");
                    }
                }

                self.record_failure(&event, &format!("{error:#}")).await;
            },
        }
    }

    /// Records a failed attempt: retry with backoff or dead-letter.
    async fn record_failure(&self, event: &Event, description: &str) {
        let attempt = u32::try_from(event.attempts).unwrap_or(1);
        let backoff = self.retry.backoff_delay(attempt);
        let now = self.clock.now_utc();

        match self.storage.events.mark_failed(event.id, description, now, backoff).await {
            Ok(Some(EventStatus::Pending)) => {
                warn!(event_id = %event.id, attempt = event.attempts,
                      backoff_ms = backoff.as_millis() as u64, "retry scheduled");

                // Wake peers for the reschedule; best-effort, the poller
                // covers a lost signal.
                if let Err(error) = notify_channel(self.storage.pool(), &self.channel).await {
                    debug!(error = %error, "reschedule notification failed");
                }
            },
            Ok(Some(EventStatus::Dead)) => {
                error!(event_id = %event.id, attempts = event.attempts,
                       max_attempts = event.max_attempts, "event dead-lettered");
            },
            Ok(_) => {},
            Err(error) => {
                error!(event_id = %event.id, error = %error,
                       "failed to record failure; stale recovery will retry the event");
            },
        }
    }
}
