//! Chronicle persistence services.
//!
//! Orchestrates appending, replaying and snapshotting aggregates through a
//! unit of work, publishes domain events to registered handlers, and drains
//! the notification outbox in the background.

pub mod config;
pub mod dispatcher;
pub mod publisher;
pub mod service;

pub use config::{DispatcherConfig, RetryPolicy};
pub use dispatcher::{DispatchReport, NotificationDispatcher, NotificationSender};
pub use publisher::{EventHandler, EventPublisher, HandlerRegistry, NoopPublisher, NotificationPublisher};
pub use service::{AggregatePersistenceService, Appended};
