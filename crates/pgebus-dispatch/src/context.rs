//! Per-dispatch context handed to every handler.

use pgebus_core::EventId;

use crate::session::EventSession;

/// Context for one event dispatch.
///
/// The session is present iff any handler matched for the event declared
/// itself transactional; it is then the same session for every handler of
/// the event.
#[derive(Debug)]
pub struct EventContext {
    /// Id of the event being dispatched.
    pub event_id: EventId,

    /// Routing key of the event.
    pub event_type: String,

    /// 1-based attempt number of this dispatch.
    pub attempt: i32,

    session: Option<EventSession>,
}

impl EventContext {
    pub(crate) fn new(
        event_id: EventId,
        event_type: impl Into<String>,
        attempt: i32,
        session: Option<EventSession>,
    ) -> Self {
        Self { event_id, event_type: event_type.into(), attempt, session }
    }

    /// Context without a session, for non-transactional dispatches and
    /// handler unit tests.
    pub fn detached(event_id: EventId, event_type: impl Into<String>, attempt: i32) -> Self {
        Self::new(event_id, event_type, attempt, None)
    }

    /// The dispatcher-managed session, when this dispatch is
    /// transactional.
    pub fn session(&mut self) -> Option<&mut EventSession> {
        self.session.as_mut()
    }

    /// Whether this dispatch runs under a dispatcher-managed transaction.
    pub fn is_transactional(&self) -> bool {
        self.session.is_some()
    }

    pub(crate) fn take_session(&mut self) -> Option<EventSession> {
        self.session.take()
    }
}
