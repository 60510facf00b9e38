/// Synchronous publish/subscribe for daemon events.
///
/// Everything runs on the single event-loop thread, so subscribers are plain
/// `FnMut` closures and delivery happens inline during [`EventBus::emit`], in
/// registration order. Nothing is buffered: a subscriber only sees events
/// emitted while it is registered.

type Subscriber<E> = Box<dyn FnMut(&E)>;

pub struct EventBus<E> {
    subscribers: Vec<Subscriber<E>>,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    /// Subscribers stay registered for the lifetime of the bus.
    pub fn subscribe(&mut self, subscriber: impl FnMut(&E) + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    pub fn emit(&mut self, event: &E) {
        for subscriber in self.subscribers.iter_mut() {
            subscriber(event);
        }
    }

    pub fn emit_all<'a>(&mut self, events: impl IntoIterator<Item = &'a E>)
    where
        E: 'a,
    {
        for event in events {
            self.emit(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
