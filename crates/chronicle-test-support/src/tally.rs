//! `Tally`: a minimal aggregate exercising every persistence capability.
//!
//! A tally is a running total. It is event-sourced, snapshotable and raises
//! a notice whenever `announce` is called.

use chrono::{TimeZone, Utc};
use chronicle_core::aggregate::{AggregateRoot, NotificationOutbox, Originator};
use chronicle_core::clock::Clock;
use chronicle_core::event::{DomainEvent, EventMetadata, NotificationEvent, NotificationMetadata};
use chronicle_core::id::AggregateId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload of a [`TallyEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TallyEventKind {
    /// The total grew by `amount`.
    Incremented {
        /// Amount added.
        amount: i64,
    },
    /// The total went back to zero.
    Reset,
}

/// Domain event produced by [`Tally`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyEvent {
    metadata: EventMetadata,
    kind: TallyEventKind,
}

impl TallyEvent {
    /// Event-type tag of `Incremented`.
    pub const INCREMENTED: &'static str = "tally.incremented";
    /// Event-type tag of `Reset`.
    pub const RESET: &'static str = "tally.reset";

    /// Returns the payload.
    #[must_use]
    pub fn kind(&self) -> &TallyEventKind {
        &self.kind
    }
}

impl DomainEvent for TallyEvent {
    type Payload = TallyEventKind;

    fn event_type(&self) -> &'static str {
        match self.kind {
            TallyEventKind::Incremented { .. } => Self::INCREMENTED,
            TallyEventKind::Reset => Self::RESET,
        }
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    fn payload(&self) -> &TallyEventKind {
        &self.kind
    }

    fn from_parts(metadata: EventMetadata, kind: TallyEventKind) -> Self {
        Self { metadata, kind }
    }
}

/// Builds a standalone `Incremented` event for `aggregate_id` at `version`.
///
/// # Panics
///
/// Never in practice; the timestamp is a valid literal.
#[must_use]
pub fn tally_event(aggregate_id: &str, version: i64, amount: i64) -> TallyEvent {
    TallyEvent {
        metadata: EventMetadata {
            event_id: Uuid::new_v4(),
            aggregate_id: AggregateId::from(aggregate_id),
            version,
            correlation_id: Uuid::new_v4(),
            causation_id: Uuid::new_v4(),
            created_by: "test".to_owned(),
            occurred_on: Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap(),
        },
        kind: TallyEventKind::Incremented { amount },
    }
}

/// Payload of a [`TallyNotification`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyNotice {
    /// Free-form text for the recipient.
    pub message: String,
    /// Total at the time the notice was raised.
    pub total: i64,
}

/// Outbox notification raised by [`Tally::announce`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyNotification {
    metadata: NotificationMetadata,
    notice: TallyNotice,
}

impl TallyNotification {
    /// Notification-type tag.
    pub const ANNOUNCED: &'static str = "tally.announced";
}

impl NotificationEvent for TallyNotification {
    type Payload = TallyNotice;

    fn notification_type(&self) -> &'static str {
        Self::ANNOUNCED
    }

    fn metadata(&self) -> &NotificationMetadata {
        &self.metadata
    }

    fn payload(&self) -> &TallyNotice {
        &self.notice
    }
}

/// Snapshot of a [`Tally`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyMemento {
    /// Total at snapshot time.
    pub total: i64,
}

/// Running total aggregate.
#[derive(Debug)]
pub struct Tally {
    id: AggregateId,
    version: i64,
    total: i64,
    uncommitted_events: Vec<TallyEvent>,
    uncommitted_notifications: Vec<TallyNotification>,
}

impl Tally {
    /// Creates an empty tally.
    #[must_use]
    pub fn new(id: impl Into<AggregateId>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            total: 0,
            uncommitted_events: Vec::new(),
            uncommitted_notifications: Vec::new(),
        }
    }

    /// Factory function suitable for `AggregateFactory`.
    #[must_use]
    pub fn shell(id: &AggregateId) -> Self {
        Self::new(id.clone())
    }

    /// Current total.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.total
    }

    /// Adds `amount` to the total.
    pub fn increment(&mut self, amount: i64, clock: &dyn Clock) {
        self.record(TallyEventKind::Incremented { amount }, clock);
    }

    /// Sets the total back to zero.
    pub fn reset(&mut self, clock: &dyn Clock) {
        self.record(TallyEventKind::Reset, clock);
    }

    /// Raises a notice for out-of-band delivery.
    pub fn announce(&mut self, message: &str, clock: &dyn Clock) {
        let caused_by = self
            .uncommitted_events
            .last()
            .map(|event| event.metadata.event_id);
        self.uncommitted_notifications.push(TallyNotification {
            metadata: NotificationMetadata {
                notification_id: Uuid::new_v4(),
                aggregate_id: self.id.clone(),
                caused_by,
                version: self.version,
                raised_on: clock.now(),
            },
            notice: TallyNotice {
                message: message.to_owned(),
                total: self.total,
            },
        });
    }

    fn record(&mut self, kind: TallyEventKind, clock: &dyn Clock) {
        let event = TallyEvent {
            metadata: EventMetadata {
                event_id: Uuid::new_v4(),
                aggregate_id: self.id.clone(),
                version: self.version + 1,
                correlation_id: Uuid::new_v4(),
                causation_id: Uuid::new_v4(),
                created_by: "test".to_owned(),
                occurred_on: clock.now(),
            },
            kind,
        };
        self.apply(&event);
        self.uncommitted_events.push(event);
    }
}

impl AggregateRoot for Tally {
    type Event = TallyEvent;

    const AGGREGATE_TYPE: &'static str = "tally";

    fn aggregate_id(&self) -> &AggregateId {
        &self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &TallyEvent) {
        match event.kind {
            TallyEventKind::Incremented { amount } => self.total += amount,
            TallyEventKind::Reset => self.total = 0,
        }
        self.version = event.metadata.version;
    }

    fn uncommitted_events(&self) -> &[TallyEvent] {
        &self.uncommitted_events
    }

    fn clear_uncommitted_events(&mut self) {
        self.uncommitted_events.clear();
    }
}

impl NotificationOutbox for Tally {
    type Notification = TallyNotification;

    fn uncommitted_notifications(&self) -> &[TallyNotification] {
        &self.uncommitted_notifications
    }

    fn clear_uncommitted_notifications(&mut self) {
        self.uncommitted_notifications.clear();
    }
}

impl Originator for Tally {
    type Memento = TallyMemento;

    const MEMENTO_TYPE: &'static str = "tally.memento";

    fn create_memento(&self) -> TallyMemento {
        TallyMemento { total: self.total }
    }

    fn set_memento(&mut self, memento: TallyMemento, version: i64) {
        self.total = memento.total;
        self.version = version;
    }
}
