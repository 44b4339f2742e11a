//! Event emission for records and stores.
//!
//! Records and stores each own an [`EventEmitter`] and expose it through the
//! [`Observable`] capability trait. Listeners subscribe by event name
//! (`"add"`, `"change:name"`, ...), by several space-separated names at once,
//! or to every event via [`ALL`].
//!
//! Handlers run synchronously inside [`EventEmitter::trigger`], after the
//! emitter's own lock is released, so a handler may freely subscribe,
//! unsubscribe or trigger further events.

use parking_lot::Mutex;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Listener name that matches every event.
pub const ALL: &str = "all";

/// An event that can be dispatched by an [`EventEmitter`].
pub trait Event: Clone + Send + Sync + 'static {
    /// Name listeners subscribe to.
    fn name(&self) -> Cow<'_, str>;
}

/// Handle returned on subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listener<E> {
    id: ListenerId,
    names: Vec<String>,
    once: bool,
    handler: Handler<E>,
}

impl<E: Event> Listener<E> {
    fn matches(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == ALL || n == name)
    }
}

/// Owned publish/subscribe component.
pub struct EventEmitter<E> {
    listeners: Mutex<Vec<Listener<E>>>,
    next_id: AtomicU64,
}

impl<E: Event> EventEmitter<E> {
    /// Create an emitter with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn subscribe<F>(&self, names: &str, once: bool, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let names = names.split_whitespace().map(str::to_string).collect();
        self.listeners.lock().push(Listener {
            id,
            names,
            once,
            handler: Arc::new(handler),
        });
        id
    }

    /// Subscribe to one or more space-separated event names.
    pub fn on<F>(&self, names: &str, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe(names, false, handler)
    }

    /// Subscribe for a single delivery.
    pub fn once<F>(&self, names: &str, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe(names, true, handler)
    }

    /// Remove a listener. Returns whether it was still subscribed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Remove every listener subscribed under `name`.
    pub fn off_name(&self, name: &str) -> usize {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !l.names.iter().any(|n| n == name));
        before - listeners.len()
    }

    /// Remove all listeners.
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    /// Number of subscribed listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Dispatch `event` to every matching listener, in subscription order.
    pub fn trigger(&self, event: &E) {
        let name = event.name();
        let handlers: Vec<Handler<E>> = {
            let mut listeners = self.listeners.lock();
            let handlers = listeners
                .iter()
                .filter(|l| l.matches(&name))
                .map(|l| Arc::clone(&l.handler))
                .collect();
            listeners.retain(|l| !(l.once && l.matches(&name)));
            handlers
        };

        for handler in handlers {
            handler(event);
        }
    }
}

impl<E: Event> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

/// Capability interface for anything that owns an [`EventEmitter`].
pub trait Observable {
    type Event: Event;

    /// The owned emitter.
    fn emitter(&self) -> &EventEmitter<Self::Event>;

    /// Subscribe to one or more space-separated event names.
    fn on<F>(&self, names: &str, handler: F) -> ListenerId
    where
        F: Fn(&Self::Event) + Send + Sync + 'static,
    {
        self.emitter().on(names, handler)
    }

    /// Subscribe for a single delivery.
    fn once<F>(&self, names: &str, handler: F) -> ListenerId
    where
        F: Fn(&Self::Event) + Send + Sync + 'static,
    {
        self.emitter().once(names, handler)
    }

    /// Unsubscribe a listener.
    fn off(&self, id: ListenerId) -> bool {
        self.emitter().off(id)
    }

    /// Unsubscribe every listener registered under `name`.
    fn off_all(&self, name: &str) -> usize {
        self.emitter().off_name(name)
    }

    /// Dispatch an event to subscribers.
    fn trigger(&self, event: &Self::Event) {
        self.emitter().trigger(event)
    }
}
