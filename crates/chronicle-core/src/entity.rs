//! Persisted row shapes.
//!
//! Every store keeps the same envelope: identity of the owning aggregate,
//! the recorded payload type, the opaque document, a version column and the
//! soft-delete/active flags used by [`Criteria`](crate::criteria::Criteria).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::AggregateId;
use crate::store::{EntityStore, UnitOfWork};

/// Columns shared by every stored flavor.
pub trait StoreEntity: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Row identifier.
    fn id(&self) -> Uuid;

    /// Owning aggregate.
    fn aggregate_id(&self) -> &AggregateId;

    /// Owning aggregate type name.
    fn aggregate_type(&self) -> &str;

    /// Version column.
    fn version(&self) -> i64;

    /// Insertion timestamp; log order is ascending on this column.
    fn created_on(&self) -> DateTime<Utc>;

    /// Soft-delete flag.
    fn is_deleted(&self) -> bool;

    /// Active flag.
    fn is_active(&self) -> bool;

    /// Selects the store that holds this flavor.
    fn store(unit_of_work: &dyn UnitOfWork) -> &dyn EntityStore<Self>;
}

/// Stored representation of a domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Aggregate this event belongs to.
    pub aggregate_id: AggregateId,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Fully qualified event type name for deserialization routing.
    pub event_type: String,
    /// Short event type name.
    pub event_name: String,
    /// Serialized event payload.
    pub event_data: serde_json::Value,
    /// Aggregate version this event produced.
    pub version: i64,
    /// Correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Causation ID linking to the causing event/command.
    pub causation_id: Uuid,
    /// Principal that caused the event.
    pub created_by: String,
    /// Timestamp of event creation in the domain.
    pub occurred_on: DateTime<Utc>,
    /// Timestamp the row was written.
    pub created_on: DateTime<Utc>,
    /// Soft-delete flag.
    pub is_deleted: bool,
    /// Active flag.
    pub is_active: bool,
}

impl StoreEntity for StoredEvent {
    fn id(&self) -> Uuid {
        self.event_id
    }

    fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn created_on(&self) -> DateTime<Utc> {
        self.created_on
    }

    fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    fn is_active(&self) -> bool {
        self.is_active
    }

    fn store(unit_of_work: &dyn UnitOfWork) -> &dyn EntityStore<Self> {
        unit_of_work.events()
    }
}

/// Delivery state of an outbox notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationState {
    /// Waiting for delivery.
    Pending,
    /// Delivered by the dispatcher.
    Delivered,
    /// Parked after exhausting the retry policy.
    Failed,
}

impl NotificationState {
    /// Column value for this state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    /// Parses a column value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Stored representation of an outbox notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredNotification {
    /// Unique notification identifier.
    pub notification_id: Uuid,
    /// Aggregate that raised the notification.
    pub aggregate_id: AggregateId,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Fully qualified notification type name.
    pub notification_type: String,
    /// Short notification type name.
    pub notification_name: String,
    /// Serialized notification payload.
    pub data: serde_json::Value,
    /// Domain event that caused the notification, if any.
    pub caused_by: Option<Uuid>,
    /// Aggregate version when the notification was raised.
    pub version: i64,
    /// Delivery state.
    pub state: NotificationState,
    /// Failed delivery attempts so far.
    pub attempts: i32,
    /// Last delivery failure, if recorded.
    pub exception: Option<String>,
    /// Timestamp the row was written.
    pub created_on: DateTime<Utc>,
    /// Timestamp of successful delivery.
    pub delivered_on: Option<DateTime<Utc>>,
    /// Soft-delete flag; set once delivered.
    pub is_deleted: bool,
    /// Active flag; cleared once parked.
    pub is_active: bool,
}

impl StoredNotification {
    /// Returns `true` while the dispatcher should still try to deliver this row.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == NotificationState::Pending && self.is_active && !self.is_deleted
    }
}

impl StoreEntity for StoredNotification {
    fn id(&self) -> Uuid {
        self.notification_id
    }

    fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn created_on(&self) -> DateTime<Utc> {
        self.created_on
    }

    fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    fn is_active(&self) -> bool {
        self.is_active
    }

    fn store(unit_of_work: &dyn UnitOfWork) -> &dyn EntityStore<Self> {
        unit_of_work.notifications()
    }
}

/// Stored representation of an aggregate snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    /// Unique snapshot identifier.
    pub snapshot_id: Uuid,
    /// Aggregate this snapshot captures.
    pub aggregate_id: AggregateId,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Recorded memento type name.
    pub memento_type: String,
    /// Serialized memento.
    pub data: serde_json::Value,
    /// Aggregate version the memento was captured at.
    pub version: i64,
    /// Timestamp the row was written.
    pub created_on: DateTime<Utc>,
    /// Soft-delete flag.
    pub is_deleted: bool,
    /// Active flag.
    pub is_active: bool,
}

impl StoreEntity for StoredSnapshot {
    fn id(&self) -> Uuid {
        self.snapshot_id
    }

    fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn created_on(&self) -> DateTime<Utc> {
        self.created_on
    }

    fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    fn is_active(&self) -> bool {
        self.is_active
    }

    fn store(unit_of_work: &dyn UnitOfWork) -> &dyn EntityStore<Self> {
        unit_of_work.snapshots()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_state_round_trips_through_column_value() {
        for state in [
            NotificationState::Pending,
            NotificationState::Delivered,
            NotificationState::Failed,
        ] {
            assert_eq!(NotificationState::parse(state.as_str()), Some(state));
        }
        assert_eq!(NotificationState::parse("sent"), None);
    }
}
