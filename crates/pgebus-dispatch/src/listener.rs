//! Dedicated LISTEN connection converting notifications into wakes.
//!
//! Owns one long-lived connection subscribed to the configured channel and
//! forwards every notification to the shared [`WakeSignal`]. Notifications
//! are an optimization: on any connection failure the listener backs off
//! and reconnects, and until it does the poller keeps the bus live.
//! The listener never touches the events table.

use std::time::Duration;

use sqlx::{postgres::PgListener, PgPool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::wake::WakeSignal;

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Listener task for the push notification channel.
pub(crate) struct ChannelListener {
    pool: PgPool,
    channel: String,
    wake: WakeSignal,
    shutdown: CancellationToken,
}

impl ChannelListener {
    pub(crate) fn new(
        pool: PgPool,
        channel: impl Into<String>,
        wake: WakeSignal,
        shutdown: CancellationToken,
    ) -> Self {
        Self { pool, channel: channel.into(), wake, shutdown }
    }

    /// Runs until shutdown, reconnecting with bounded backoff on failure.
    pub(crate) async fn run(self) {
        let mut backoff = RECONNECT_BASE;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.subscribe().await {
                Ok(listener) => {
                    info!(channel = %self.channel, "listener subscribed");
                    backoff = RECONNECT_BASE;

                    if self.pump(listener).await.is_break() {
                        break;
                    }
                },
                Err(error) => {
                    warn!(channel = %self.channel, error = %error, "listener failed to subscribe");
                },
            }

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(backoff) => {},
            }
            backoff = std::cmp::min(backoff * 2, RECONNECT_MAX);
        }

        info!(channel = %self.channel, "listener stopped");
    }

    async fn subscribe(&self) -> sqlx::Result<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        Ok(listener)
    }

    /// Forwards notifications until the connection drops or shutdown.
    async fn pump(&self, mut listener: PgListener) -> std::ops::ControlFlow<()> {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    return std::ops::ControlFlow::Break(());
                },
                received = listener.recv() => match received {
                    Ok(_) => {
                        debug!(channel = %self.channel, "notification received");
                        self.wake.wake_all();
                    },
                    Err(error) => {
                        warn!(channel = %self.channel, error = %error,
                              "listener connection lost, reconnecting");
                        return std::ops::ControlFlow::Continue(());
                    },
                },
            }
        }
    }
}
