//! In-process wake signal shared by listener, poller and workers.

use std::sync::Arc;

use tokio::sync::Notify;

/// Broadcast point turning database notifications and poll ticks into
/// worker wake-ups.
///
/// Rapid signals coalesce: a storm of notifications produces at most one
/// extra claim cycle per waiting worker. A signal arriving while no worker
/// is parked is dropped; acceptable, because workers drain the queue
/// before parking and the poller re-wakes them every interval regardless.
#[derive(Clone, Debug, Default)]
pub struct WakeSignal {
    notify: Arc<Notify>,
}

impl WakeSignal {
    /// Creates a new wake signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes every currently parked worker.
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    /// Parks until the next wake.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn wake_releases_parked_waiters() {
        let signal = WakeSignal::new();

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };

        // Let the waiter park before signalling.
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.wake_all();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be woken")
            .expect("waiter task should not panic");
    }

    #[tokio::test]
    async fn signals_coalesce() {
        let signal = WakeSignal::new();

        // Many wakes with nobody parked must not queue up.
        for _ in 0..100 {
            signal.wake_all();
        }

        let result =
            tokio::time::timeout(Duration::from_millis(50), signal.wait()).await;
        assert!(result.is_err(), "stored wakes should not accumulate");
    }
}
