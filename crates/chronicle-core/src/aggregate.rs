//! Aggregate capability traits.
//!
//! Each persistence feature requires a capability trait on the aggregate
//! type. Operations are bounded by these traits, so asking the engine to
//! snapshot an aggregate that is not an [`Originator`] is a compile error.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::PersistenceError;
use crate::event::{DomainEvent, NotificationEvent};
use crate::id::AggregateId;

/// Event-sourcing capability: aggregate roots that reconstitute from event history.
pub trait AggregateRoot: Send + Sync {
    /// The event type this aggregate produces and consumes.
    type Event: DomainEvent;

    /// Aggregate type name recorded on every stored row.
    const AGGREGATE_TYPE: &'static str;

    /// Returns the aggregate identifier.
    fn aggregate_id(&self) -> &AggregateId;

    /// Returns the current version (number of events applied).
    fn version(&self) -> i64;

    /// Returns `true` until at least one event has been applied.
    fn is_empty(&self) -> bool {
        self.version() == 0
    }

    /// Apply an event to mutate internal state (used during reconstitution).
    fn apply(&mut self, event: &Self::Event);

    /// Returns uncommitted events produced by command handling.
    fn uncommitted_events(&self) -> &[Self::Event];

    /// Clears uncommitted events after persistence.
    fn clear_uncommitted_events(&mut self);
}

/// Outbox capability: aggregates that raise notifications for later delivery.
pub trait NotificationOutbox: AggregateRoot {
    /// The notification type this aggregate raises.
    type Notification: NotificationEvent;

    /// Returns notifications raised since the last commit.
    fn uncommitted_notifications(&self) -> &[Self::Notification];

    /// Clears uncommitted notifications after persistence.
    fn clear_uncommitted_notifications(&mut self);
}

/// Snapshot capability: aggregates that can capture and restore a memento.
pub trait Originator: AggregateRoot {
    /// Captured aggregate state.
    type Memento: Serialize + DeserializeOwned + Send + Sync;

    /// Type name recorded on snapshot rows.
    const MEMENTO_TYPE: &'static str;

    /// Captures the current state.
    fn create_memento(&self) -> Self::Memento;

    /// Restores state from a memento taken at `version`.
    fn set_memento(&mut self, memento: Self::Memento, version: i64);
}

/// Instance-creation capability: builds the empty shell that history is folded into.
pub trait AggregateFactory<A>: Send + Sync {
    /// Creates an empty aggregate for `aggregate_id`.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::InstanceCreation` if the shell cannot be built.
    fn create(&self, aggregate_id: &AggregateId) -> Result<A, PersistenceError>;
}

impl<A, F> AggregateFactory<A> for F
where
    F: Fn(&AggregateId) -> A + Send + Sync,
{
    fn create(&self, aggregate_id: &AggregateId) -> Result<A, PersistenceError> {
        Ok(self(aggregate_id))
    }
}
