use super::events::{EventKind, PushEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A push-event callback. Identity is the `Arc` allocation: registering the
/// same handle twice is a no-op, and `off` needs the handle that was passed
/// to `on`.
pub type Subscriber = Arc<dyn Fn(&PushEvent) + Send + Sync>;

pub fn subscriber<F>(f: F) -> Subscriber
where
    F: Fn(&PushEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

pub(crate) fn same_subscriber(a: &Subscriber, b: &Subscriber) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Per-kind subscriber sets, kept in registration order.
#[derive(Default)]
pub struct SubscriptionRegistry {
    handlers: Mutex<HashMap<EventKind, Vec<Subscriber>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EventKind, Vec<Subscriber>>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `false` if `handler` was already registered for `kind`.
    pub fn on(&self, kind: EventKind, handler: &Subscriber) -> bool {
        let mut handlers = self.lock();
        let set = handlers.entry(kind).or_default();
        if set.iter().any(|h| same_subscriber(h, handler)) {
            return false;
        }
        set.push(Arc::clone(handler));
        true
    }

    /// Returns `false` if `handler` was not registered for `kind`.
    pub fn off(&self, kind: EventKind, handler: &Subscriber) -> bool {
        let mut handlers = self.lock();
        let Some(set) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = set.len();
        set.retain(|h| !same_subscriber(h, handler));
        let removed = set.len() != before;
        if set.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    /// Snapshot of the subscribers for `kind`, so dispatch never holds the lock
    /// while callbacks run.
    pub fn subscribers(&self, kind: EventKind) -> Vec<Subscriber> {
        self.lock().get(&kind).cloned().unwrap_or_default()
    }

    /// Whether `handler` is registered under any kind.
    pub fn is_registered(&self, handler: &Subscriber) -> bool {
        self.lock()
            .values()
            .any(|set| set.iter().any(|h| same_subscriber(h, handler)))
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
