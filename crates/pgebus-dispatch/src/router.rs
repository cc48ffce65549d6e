//! Composable handler registry with exact-match lookup.
//!
//! Handlers register against a dotted path (`"billing.invoice.created"`).
//! Routers nest: `nest("billing", invoice_router)` prefixes every path in
//! the child with `billing.`. At bus start the tree is frozen into a flat
//! immutable map; lookup is exact string equality against the event type,
//! and the handlers for a path run sequentially in depth-first
//! registration order.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use crate::context::EventContext;

/// A user-supplied event handler.
///
/// Handlers receive the dispatch context and the event payload. Returning
/// an error aborts the remaining handlers for the event and schedules a
/// retry (or dead-letters the row once its budget is spent). Handlers must
/// be idempotent: delivery is at-least-once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event dispatch.
    async fn call(&self, ctx: &mut EventContext, payload: &Value) -> anyhow::Result<()>;
}

/// A registered handler with its routing metadata.
pub struct HandlerEntry {
    /// Fully-qualified dotted path the handler is registered under.
    pub path: String,

    /// Whether this handler requires the dispatcher-managed transaction.
    pub transactional: bool,

    handler: Box<dyn EventHandler>,
}

impl HandlerEntry {
    /// Invokes the underlying handler.
    pub async fn call(&self, ctx: &mut EventContext, payload: &Value) -> anyhow::Result<()> {
        self.handler.call(ctx, payload).await
    }
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("path", &self.path)
            .field("transactional", &self.transactional)
            .finish_non_exhaustive()
    }
}

enum Registration {
    Handler(HandlerEntry),
    Nested { prefix: String, router: Router },
}

/// Composable registry builder, consumed by the bus at start.
///
/// Registration order is preserved; nested routers flatten depth-first, so
/// handlers appear exactly in the order the composed tree declared them.
#[derive(Default)]
pub struct Router {
    registrations: Vec<Registration>,
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `path`.
    #[must_use]
    pub fn on<H>(mut self, path: impl Into<String>, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        self.registrations.push(Registration::Handler(HandlerEntry {
            path: path.into(),
            transactional: false,
            handler: Box::new(handler),
        }));
        self
    }

    /// Registers a handler for `path` that runs inside the
    /// dispatcher-managed transaction.
    ///
    /// When any handler matched for an event is transactional, one
    /// transaction spans the whole dispatch and every matched handler
    /// receives it through the context.
    #[must_use]
    pub fn on_transactional<H>(mut self, path: impl Into<String>, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        self.registrations.push(Registration::Handler(HandlerEntry {
            path: path.into(),
            transactional: true,
            handler: Box::new(handler),
        }));
        self
    }

    /// Mounts a child router under `prefix`.
    ///
    /// Every path in the child is prefixed with `prefix.`; an empty prefix
    /// merges the child in place.
    #[must_use]
    pub fn nest(mut self, prefix: impl Into<String>, router: Router) -> Self {
        self.registrations.push(Registration::Nested { prefix: prefix.into(), router });
        self
    }

    /// Flattens the tree into the immutable lookup map.
    pub(crate) fn freeze(self) -> RouterMap {
        let mut map: HashMap<String, Vec<Arc<HandlerEntry>>> = HashMap::new();
        Self::flatten(self, None, &mut map);
        RouterMap { map }
    }

    fn flatten(
        router: Router,
        prefix: Option<&str>,
        map: &mut HashMap<String, Vec<Arc<HandlerEntry>>>,
    ) {
        for registration in router.registrations {
            match registration {
                Registration::Handler(mut entry) => {
                    entry.path = join_path(prefix, &entry.path);
                    map.entry(entry.path.clone()).or_default().push(Arc::new(entry));
                },
                Registration::Nested { prefix: child_prefix, router: child } => {
                    let combined = join_path(prefix, &child_prefix);
                    let combined = if combined.is_empty() { None } else { Some(combined) };
                    Self::flatten(child, combined.as_deref(), map);
                },
            }
        }
    }
}

fn join_path(prefix: Option<&str>, path: &str) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => {
            if path.is_empty() {
                prefix.to_string()
            } else {
                format!("{prefix}.{path}")
            }
        },
        _ => path.to_string(),
    }
}

/// Immutable, flattened lookup map. Read-only after bus start.
#[derive(Debug, Default)]
pub struct RouterMap {
    map: HashMap<String, Vec<Arc<HandlerEntry>>>,
}

impl RouterMap {
    /// Handlers registered for exactly `event_type`, in registration
    /// order. Empty when nothing matches; the worker treats an empty match
    /// as a successful no-op so stray event types never accumulate dead
    /// rows.
    pub fn matches(&self, event_type: &str) -> &[Arc<HandlerEntry>] {
        self.map.get(event_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of distinct registered paths.
    pub fn route_count(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc as StdArc,
    };

    use super::*;

    struct Recording {
        label: &'static str,
        order: StdArc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl EventHandler for Recording {
        async fn call(&self, _ctx: &mut EventContext, _payload: &Value) -> anyhow::Result<()> {
            self.order.lock().unwrap().push(self.label);
            Ok(())
        }
    }

    struct Counting(StdArc<AtomicUsize>);

    #[async_trait]
    impl EventHandler for Counting {
        async fn call(&self, _ctx: &mut EventContext, _payload: &Value) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting() -> (Counting, StdArc<AtomicUsize>) {
        let counter = StdArc::new(AtomicUsize::new(0));
        (Counting(counter.clone()), counter)
    }

    #[test]
    fn exact_match_only() {
        let (handler, _) = counting();
        let map = Router::new().on("billing.invoice", handler).freeze();

        assert_eq!(map.matches("billing.invoice").len(), 1);
        assert!(map.matches("billing").is_empty());
        assert!(map.matches("billing.invoice.created").is_empty());
        assert!(map.matches("").is_empty());
    }

    #[test]
    fn nested_paths_join_with_dots() {
        let (handler, _) = counting();
        let inner = Router::new().on("created", handler);
        let map = Router::new().nest("billing", Router::new().nest("invoice", inner)).freeze();

        assert_eq!(map.matches("billing.invoice.created").len(), 1);
        assert!(map.matches("invoice.created").is_empty());
    }

    #[test]
    fn empty_prefix_merges_in_place() {
        let (handler, _) = counting();
        let map = Router::new().nest("", Router::new().on("audit.log", handler)).freeze();

        assert_eq!(map.matches("audit.log").len(), 1);
    }

    #[test]
    fn same_path_handlers_keep_registration_order() {
        let order = StdArc::new(std::sync::Mutex::new(Vec::new()));
        let map = Router::new()
            .on("evt", Recording { label: "first", order: order.clone() })
            .nest("", Router::new().on("evt", Recording { label: "nested", order: order.clone() }))
            .on("evt", Recording { label: "last", order: order.clone() })
            .freeze();

        let entries = map.matches("evt");
        assert_eq!(entries.len(), 3);

        // Depth-first flattening preserves declaration order across the
        // composed tree.
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let mut ctx = EventContext::detached(1.into(), "evt", 1);
            for entry in entries {
                entry.call(&mut ctx, &Value::Null).await.unwrap();
            }
        });
        assert_eq!(*order.lock().unwrap(), vec!["first", "nested", "last"]);
    }

    #[test]
    fn transactional_flag_preserved() {
        let (a, _) = counting();
        let (b, _) = counting();
        let map = Router::new().on("evt", a).on_transactional("evt", b).freeze();

        let entries = map.matches("evt");
        assert!(!entries[0].transactional);
        assert!(entries[1].transactional);
    }

    #[test]
    fn route_count_reflects_distinct_paths() {
        let (a, _) = counting();
        let (b, _) = counting();
        let (c, _) = counting();
        let map = Router::new().on("x", a).on("x", b).on("y", c).freeze();

        assert_eq!(map.route_count(), 2);
    }
}
