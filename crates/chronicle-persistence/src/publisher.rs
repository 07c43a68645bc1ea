//! Synchronous domain event publishing.
//!
//! Handlers are registered against an event-type tag at startup. Publishing
//! looks the tag up and runs every handler for it; a tag with no handlers is
//! a logged no-op.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chronicle_core::error::PersistenceError;
use chronicle_core::event::DomainEvent;
use chronicle_core::store::cancellable;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reacts to one kind of domain event.
#[async_trait]
pub trait EventHandler<E: DomainEvent>: Send + Sync {
    /// Handles `event`.
    ///
    /// # Errors
    ///
    /// Any error aborts the surrounding append.
    async fn handle(&self, event: &E) -> Result<(), PersistenceError>;
}

/// Publishes domain events as they are appended.
#[async_trait]
pub trait EventPublisher<E: DomainEvent>: Send + Sync {
    /// Publishes one event.
    ///
    /// # Errors
    ///
    /// Returns the first handler error, or `PersistenceError::Cancelled`.
    async fn publish(&self, event: &E, cancel: &CancellationToken) -> Result<(), PersistenceError>;
}

/// Startup-built map from event-type tag to handlers.
pub struct HandlerRegistry<E: DomainEvent> {
    handlers: HashMap<&'static str, Vec<Arc<dyn EventHandler<E>>>>,
}

impl<E: DomainEvent> Default for HandlerRegistry<E> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<E: DomainEvent> fmt::Debug for HandlerRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (event_type, handlers) in &self.handlers {
            map.entry(event_type, &handlers.len());
        }
        map.finish()
    }
}

impl<E: DomainEvent> HandlerRegistry<E> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events tagged `event_type`.
    pub fn register(&mut self, event_type: &'static str, handler: Arc<dyn EventHandler<E>>) {
        self.handlers.entry(event_type).or_default().push(handler);
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, event_type: &'static str, handler: Arc<dyn EventHandler<E>>) -> Self {
        self.register(event_type, handler);
        self
    }

    /// Returns the handlers registered for `event_type`.
    #[must_use]
    pub fn resolve(&self, event_type: &str) -> &[Arc<dyn EventHandler<E>>] {
        self.handlers.get(event_type).map_or(&[], Vec::as_slice)
    }
}

/// Publisher that dispatches to a [`HandlerRegistry`].
#[derive(Debug)]
pub struct NotificationPublisher<E: DomainEvent> {
    registry: HandlerRegistry<E>,
}

impl<E: DomainEvent> NotificationPublisher<E> {
    /// Creates a publisher over `registry`.
    #[must_use]
    pub fn new(registry: HandlerRegistry<E>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl<E: DomainEvent> EventPublisher<E> for NotificationPublisher<E> {
    async fn publish(&self, event: &E, cancel: &CancellationToken) -> Result<(), PersistenceError> {
        let handlers = self.registry.resolve(event.event_type());
        if handlers.is_empty() {
            debug!(
                event_type = event.event_type(),
                event_id = %event.metadata().event_id,
                "no handlers registered, publish skipped"
            );
            return Ok(());
        }

        debug!(
            event_type = event.event_type(),
            handlers = handlers.len(),
            "publishing event"
        );
        cancellable(cancel, async {
            join_all(handlers.iter().map(|handler| handler.handle(event)))
                .await
                .into_iter()
                .collect::<Result<Vec<()>, _>>()
                .map(|_| ())
        })
        .await
    }
}

/// Publisher for aggregates nobody subscribes to.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl<E: DomainEvent> EventPublisher<E> for NoopPublisher {
    async fn publish(&self, _event: &E, _cancel: &CancellationToken) -> Result<(), PersistenceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chronicle_test_support::{TallyEvent, tally_event};

    use super::*;

    #[derive(Debug, Default)]
    struct Recorder {
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl EventHandler<TallyEvent> for Recorder {
        async fn handle(&self, event: &TallyEvent) -> Result<(), PersistenceError> {
            self.seen.lock().unwrap().push(event.metadata().version);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Exploding;

    #[async_trait]
    impl EventHandler<TallyEvent> for Exploding {
        async fn handle(&self, _event: &TallyEvent) -> Result<(), PersistenceError> {
            Err(PersistenceError::Handler("mailer offline".into()))
        }
    }

    #[tokio::test]
    async fn test_publish_without_handlers_is_a_no_op() {
        // Arrange
        let publisher = NotificationPublisher::new(HandlerRegistry::<TallyEvent>::new());
        let event = tally_event("t-1", 1, 5);

        // Act
        let result = publisher.publish(&event, &CancellationToken::new()).await;

        // Assert
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_publish_invokes_every_handler_for_the_tag() {
        // Arrange
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let registry = HandlerRegistry::<TallyEvent>::new()
            .with(TallyEvent::INCREMENTED, first.clone())
            .with(TallyEvent::INCREMENTED, second.clone());
        let publisher = NotificationPublisher::new(registry);

        // Act
        publisher
            .publish(&tally_event("t-1", 3, 5), &CancellationToken::new())
            .await
            .unwrap();

        // Assert
        assert_eq!(*first.seen.lock().unwrap(), vec![3]);
        assert_eq!(*second.seen.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_publish_ignores_handlers_for_other_tags() {
        let recorder = Arc::new(Recorder::default());
        let registry = HandlerRegistry::<TallyEvent>::new().with(TallyEvent::RESET, recorder.clone());
        let publisher = NotificationPublisher::new(registry);

        publisher
            .publish(&tally_event("t-1", 1, 5), &CancellationToken::new())
            .await
            .unwrap();

        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        // Arrange
        let recorder = Arc::new(Recorder::default());
        let registry = HandlerRegistry::<TallyEvent>::new()
            .with(TallyEvent::INCREMENTED, recorder.clone())
            .with(TallyEvent::INCREMENTED, Arc::new(Exploding));
        let publisher = NotificationPublisher::new(registry);

        // Act
        let result = publisher
            .publish(&tally_event("t-1", 1, 5), &CancellationToken::new())
            .await;

        // Assert
        match result {
            Err(PersistenceError::Handler(msg)) => assert_eq!(msg, "mailer offline"),
            other => panic!("expected Handler error, got {other:?}"),
        }
        assert_eq!(*recorder.seen.lock().unwrap(), vec![1]);
    }
}
