//! In-process change notifications.
//!
//! Producers own an [`EventHub`] and fire it synchronously; handlers run in
//! registration order on the caller's task, so a notification never
//! interleaves with another recomputation.

type Handler<T> = Box<dyn FnMut(&T) + Send>;

pub struct EventHub<T> {
    handlers: Vec<Handler<T>>,
}

impl<T> EventHub<T> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn subscribe<F>(&mut self, handler: F)
    where
        F: FnMut(&T) + Send + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    pub fn trigger(&mut self, value: &T) {
        for handler in self.handlers.iter_mut() {
            handler(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

impl<T> Default for EventHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for EventHub<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.handlers.len())
            .finish()
    }
}
