//! In-process pub-sub for primitive lifecycle events
//!
//! Each primitive instance owns one [`EventPublisher`] parameterized by its
//! event type. Publication is synchronous and ordered: subscribers see the
//! events of a given instance in the order they were published, each
//! subscription at least once. Event construction on hot paths is guarded
//! by [`EventPublisher::has_subscribers`].

use parking_lot::RwLock;
use std::sync::Arc;

type Subscriber<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered, synchronous publisher for a single primitive instance.
pub struct EventPublisher<E> {
    subscribers: RwLock<Vec<Subscriber<E>>>,
}

impl<E> EventPublisher<E> {
    /// Create a publisher with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a subscriber. Subscribers are invoked in registration
    /// order and stay registered for the life of the primitive.
    pub fn on_event<F>(&self, subscriber: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(subscriber));
    }

    /// Whether anybody is listening. Publishers check this before paying
    /// for event construction.
    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.read().is_empty()
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver an event to every subscriber, in registration order.
    pub fn publish(&self, event: &E) {
        let subscribers = self.subscribers.read();
        for subscriber in subscribers.iter() {
            subscriber(event);
        }
    }
}

impl<E> Default for EventPublisher<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventPublisher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
