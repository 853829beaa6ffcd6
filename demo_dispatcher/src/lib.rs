use std::panic::{catch_unwind, AssertUnwindSafe};

use ahash::AHashMap as HashMap;
use uuid::Uuid;

/// Opaque identifier returned by registration, used to unregister.
pub type HandlerIdentifier = Uuid;

/// A value that can be routed by tag.
///
/// Dispatch is by tag, not by type: every event value reports the tag of its
/// variant, and handlers subscribe to a single tag or to every tag at once.
pub trait Dispatchable {
    type Tag: Copy + Eq + std::hash::Hash;

    fn tag(&self) -> Self::Tag;
}

struct Listener<E> {
    id: HandlerIdentifier,
    callback: Box<dyn FnMut(&E) + Send>,
}

type PanicHandler = Box<dyn Fn(String) + Send + Sync>;

/// Single-threaded handler registry.
///
/// Handlers for a tag run in registration order, followed by the "any"
/// handlers in registration order. A panicking handler never unwinds through
/// `dispatch`; the payload is forwarded to the panic handler instead.
pub struct Dispatcher<E: Dispatchable> {
    listeners: HashMap<E::Tag, Vec<Listener<E>>>,
    any_listeners: Vec<Listener<E>>,
    panic_handler: Option<PanicHandler>,
}

impl<E: Dispatchable> Default for Dispatcher<E> {
    fn default() -> Self {
        Self {
            listeners: HashMap::new(),
            any_listeners: Vec::new(),
            panic_handler: None,
        }
    }
}

impl<E: Dispatchable> Dispatcher<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_panic_handler(handler: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self {
            panic_handler: Some(Box::new(handler)),
            ..Self::default()
        }
    }

    /// Registers a handler invoked exactly when an event of `tag` fires.
    pub fn register(
        &mut self,
        tag: E::Tag,
        callback: impl FnMut(&E) + Send + 'static,
    ) -> HandlerIdentifier {
        let id = Uuid::new_v4();
        self.listeners.entry(tag).or_default().push(Listener {
            id,
            callback: Box::new(callback),
        });
        id
    }

    /// Registers a handler invoked for every event regardless of tag.
    pub fn register_any(&mut self, callback: impl FnMut(&E) + Send + 'static) -> HandlerIdentifier {
        let id = Uuid::new_v4();
        self.any_listeners.push(Listener {
            id,
            callback: Box::new(callback),
        });
        id
    }

    /// Removes a previously registered handler. Returns whether it existed.
    pub fn unregister(&mut self, id: HandlerIdentifier) -> bool {
        for listeners in self.listeners.values_mut() {
            if let Some(pos) = listeners.iter().position(|l| l.id == id) {
                listeners.remove(pos);
                return true;
            }
        }
        if let Some(pos) = self.any_listeners.iter().position(|l| l.id == id) {
            self.any_listeners.remove(pos);
            return true;
        }
        false
    }

    pub fn dispatch(&mut self, event: &E) {
        let tag = event.tag();
        if let Some(listeners) = self.listeners.get_mut(&tag) {
            for listener in listeners.iter_mut() {
                Self::invoke(listener, event, &self.panic_handler);
            }
        }
        for listener in self.any_listeners.iter_mut() {
            Self::invoke(listener, event, &self.panic_handler);
        }
    }

    fn invoke(listener: &mut Listener<E>, event: &E, panic_handler: &Option<PanicHandler>) {
        let result = catch_unwind(AssertUnwindSafe(|| (listener.callback)(event)));
        if let Err(payload) = result {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            match panic_handler {
                Some(h) => h(message),
                None => std::panic::resume_unwind(payload),
            }
        }
    }
}
