//! Handler probes and polling helpers for integration tests.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgebus_core::{EventId, EventStatus, Storage};
use pgebus_dispatch::{EventContext, EventHandler};
use serde_json::Value;

/// Handler that counts invocations and remembers the payloads it saw.
#[derive(Clone, Default)]
pub struct CountingHandler {
    hits: Arc<AtomicUsize>,
    payloads: Arc<Mutex<Vec<Value>>>,
}

impl CountingHandler {
    /// Creates a fresh probe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Invocations so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Payloads observed, in invocation order.
    pub fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for CountingHandler {
    async fn call(&self, _ctx: &mut EventContext, payload: &Value) -> Result<()> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

/// Handler that always fails with a fixed message, recording each
/// invocation time.
#[derive(Clone)]
pub struct FailingHandler {
    message: String,
    invocations: Arc<Mutex<Vec<DateTime<Utc>>>>,
}

impl FailingHandler {
    /// Creates a probe failing with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), invocations: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Invocation timestamps, in order.
    pub fn invocations(&self) -> Vec<DateTime<Utc>> {
        self.invocations.lock().unwrap().clone()
    }

    /// Number of invocations so far.
    pub fn hits(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl EventHandler for FailingHandler {
    async fn call(&self, _ctx: &mut EventContext, _payload: &Value) -> Result<()> {
        self.invocations.lock().unwrap().push(Utc::now());
        Err(anyhow!(self.message.clone()))
    }
}

/// Polls until the event reaches `expected`, failing after `timeout`.
///
/// # Errors
///
/// Returns an error when the timeout elapses or the row disappears.
pub async fn wait_for_status(
    storage: &Storage,
    id: EventId,
    expected: EventStatus,
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let event = storage
            .events
            .find_by_id(id)
            .await?
            .ok_or_else(|| anyhow!("event {id} disappeared"))?;

        if event.status == expected {
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            bail!(
                "event {id} still {} after {timeout:?}, expected {expected}",
                event.status
            );
        }

        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Polls until `probe` has at least `expected` hits, failing after
/// `timeout`.
///
/// # Errors
///
/// Returns an error when the timeout elapses first.
pub async fn wait_for_hits(probe: &CountingHandler, expected: usize, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;

    while probe.hits() < expected {
        if tokio::time::Instant::now() >= deadline {
            bail!("probe saw {} hits after {timeout:?}, expected {expected}", probe.hits());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    Ok(())
}
