//! Domain models, event store and producer surface for pgebus.
//!
//! pgebus is a durable, at-least-once event bus whose single source of
//! truth is PostgreSQL. This crate owns the events table contract: row
//! models, the claim/transition SQL, configuration, and the publish helper
//! producers call inside their own transactions. The dispatcher that turns
//! pending rows into handler invocations lives in `pgebus-dispatch`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod models;
pub mod publish;
pub mod storage;
pub mod time;

pub use config::{Config, DatabaseConfig, EventSystemConfig};
pub use error::{CoreError, Result};
pub use models::{Event, EventId, EventStatus, NewEvent, WorkerId};
pub use publish::{notify_channel, publish_event};
pub use storage::Storage;
pub use time::{Clock, SystemClock};
