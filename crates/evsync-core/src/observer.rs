//! Typed subscriber lists.

use std::fmt;

/// Handle returned by [`Observers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Handler<T> = Box<dyn FnMut(&T) + Send>;

/// Subscribers to one kind of event, called in registration order.
pub struct Observers<T> {
    next_id: u64,
    handlers: Vec<(SubscriptionId, Handler<T>)>,
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self { next_id: 0, handlers: Vec::new() }
    }
}

impl<T> fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers").field("subscribers", &self.handlers.len()).finish()
    }
}

impl<T> Observers<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`.
    pub fn subscribe(&mut self, handler: impl FnMut(&T) + Send + 'static) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.handlers.push((id, Box::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(existing, _)| *existing != id);
        self.handlers.len() != before
    }

    /// Call every handler with `event`.
    pub fn emit(&mut self, event: &T) {
        for (_, handler) in &mut self.handlers {
            handler(event);
        }
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if nobody is listening.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn emits_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut observers = Observers::<u32>::new();

        let first = Arc::clone(&seen);
        observers.subscribe(move |n| first.lock().unwrap().push(("first", *n)));
        let second = Arc::clone(&seen);
        let id = observers.subscribe(move |n| second.lock().unwrap().push(("second", *n)));

        observers.emit(&1);
        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        observers.emit(&2);

        assert_eq!(*seen.lock().unwrap(), vec![("first", 1), ("second", 1), ("first", 2)]);
    }
}
