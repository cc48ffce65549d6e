//! Dispatcher subsystem of pgebus.
//!
//! Turns pending event rows into handler invocations: a pool of workers
//! claims rows with `FOR UPDATE SKIP LOCKED`, runs the handlers registered
//! for the event's type under the dispatcher's transactional policy, and
//! records success or failure with bounded exponential-backoff retries.
//! Workers are woken by PostgreSQL notifications and by a fallback poll,
//! so notifications are never required for correctness.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod context;
pub mod error;
mod listener;
mod poller;
pub mod retry;
pub mod router;
pub mod session;
pub mod wake;
mod worker;
mod worker_pool;

pub use bus::{BusConfig, EventBus};
pub use context::EventContext;
pub use error::{DispatchError, Result};
pub use retry::RetryPolicy;
pub use router::{EventHandler, HandlerEntry, Router, RouterMap};
pub use session::EventSession;
pub use wake::WakeSignal;
