//! Domain event and notification abstractions.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::AggregateId;

/// Metadata attached to every domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Aggregate/stream this event belongs to.
    pub aggregate_id: AggregateId,
    /// The aggregate version this event produces. Strictly increasing per stream.
    pub version: i64,
    /// Correlation ID for tracing a command through its effects.
    pub correlation_id: Uuid,
    /// Causation ID linking this event to the event/command that caused it.
    pub causation_id: Uuid,
    /// Principal that caused the event.
    pub created_by: String,
    /// Timestamp of event creation.
    pub occurred_on: DateTime<Utc>,
}

/// Trait that all domain events implement.
///
/// An event is split into its metadata and a serializable payload so the
/// persistence engine can store the payload as an opaque document and
/// rebuild the event from a stored row.
pub trait DomainEvent: Send + Sync + std::fmt::Debug + Sized {
    /// The serializable event body.
    type Payload: Serialize + DeserializeOwned + Send + Sync;

    /// Returns the fully qualified event type name (used for rehydration routing).
    fn event_type(&self) -> &'static str;

    /// Returns the short event type name.
    fn event_name(&self) -> &'static str {
        let full = self.event_type();
        full.rsplit('.').next().unwrap_or(full)
    }

    /// Returns the metadata for this event.
    fn metadata(&self) -> &EventMetadata;

    /// Returns the event payload.
    fn payload(&self) -> &Self::Payload;

    /// Rebuilds an event from stored metadata and a decoded payload.
    fn from_parts(metadata: EventMetadata, payload: Self::Payload) -> Self;
}

/// Metadata attached to every outbox notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMetadata {
    /// Unique notification identifier.
    pub notification_id: Uuid,
    /// Aggregate that raised the notification.
    pub aggregate_id: AggregateId,
    /// The domain event that caused this notification, if any.
    pub caused_by: Option<Uuid>,
    /// Aggregate version at the time the notification was raised.
    pub version: i64,
    /// Timestamp the notification was raised.
    pub raised_on: DateTime<Utc>,
}

/// Trait for outbox messages delivered asynchronously by the dispatcher.
///
/// Notifications are never published on the synchronous event path.
pub trait NotificationEvent: Send + Sync + std::fmt::Debug {
    /// The serializable notification body.
    type Payload: Serialize + Send + Sync;

    /// Returns the fully qualified notification type name.
    fn notification_type(&self) -> &'static str;

    /// Returns the short notification type name.
    fn notification_name(&self) -> &'static str {
        let full = self.notification_type();
        full.rsplit('.').next().unwrap_or(full)
    }

    /// Returns the metadata for this notification.
    fn metadata(&self) -> &NotificationMetadata;

    /// Returns the notification payload.
    fn payload(&self) -> &Self::Payload;
}
