//! Aggregate persistence service.
//!
//! Flushes an aggregate's uncommitted buffers into the stores of a unit of
//! work, rebuilds aggregates from their event history and manages
//! snapshots. One service instance is bound to one aggregate type. Every
//! call begins its own unit of work, so concurrent callers never share
//! staged rows.

use std::fmt;
use std::sync::Arc;

use chronicle_core::aggregate::{AggregateFactory, AggregateRoot, NotificationOutbox, Originator};
use chronicle_core::clock::{Clock, SystemClock};
use chronicle_core::codec::{Codec, JsonCodec};
use chronicle_core::criteria::Criteria;
use chronicle_core::entity::{
    NotificationState, StoreEntity, StoredEvent, StoredNotification, StoredSnapshot,
};
use chronicle_core::error::PersistenceError;
use chronicle_core::event::{DomainEvent, EventMetadata, NotificationEvent};
use chronicle_core::id::AggregateId;
use chronicle_core::store::{UnitOfWork, UnitOfWorkFactory};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::publisher::EventPublisher;

/// Rows written by one append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Appended {
    /// Domain events inserted and published.
    pub events: usize,
    /// Notifications inserted into the outbox.
    pub notifications: usize,
}

impl Appended {
    /// Returns `true` when nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events == 0 && self.notifications == 0
    }
}

/// Appends, replays and snapshots aggregates of type `A`.
pub struct AggregatePersistenceService<A: AggregateRoot, C = JsonCodec> {
    database: Arc<dyn UnitOfWorkFactory>,
    publisher: Arc<dyn EventPublisher<A::Event>>,
    factory: Arc<dyn AggregateFactory<A>>,
    codec: C,
    clock: Arc<dyn Clock>,
}

impl<A: AggregateRoot, C: fmt::Debug> fmt::Debug for AggregatePersistenceService<A, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatePersistenceService")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl<A: AggregateRoot> AggregatePersistenceService<A> {
    /// Creates a service using the JSON codec and the system clock.
    #[must_use]
    pub fn new(
        database: Arc<dyn UnitOfWorkFactory>,
        publisher: Arc<dyn EventPublisher<A::Event>>,
        factory: Arc<dyn AggregateFactory<A>>,
    ) -> Self {
        Self {
            database,
            publisher,
            factory,
            codec: JsonCodec,
            clock: Arc::new(SystemClock),
        }
    }
}

impl<A: AggregateRoot, C: Codec> AggregatePersistenceService<A, C> {
    /// Replaces the clock that stamps `created_on`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the payload codec.
    #[must_use]
    pub fn with_codec<C2: Codec>(self, codec: C2) -> AggregatePersistenceService<A, C2> {
        AggregatePersistenceService {
            database: self.database,
            publisher: self.publisher,
            factory: self.factory,
            codec,
            clock: self.clock,
        }
    }

    /// The database this service begins units of work on.
    #[must_use]
    pub fn database(&self) -> &Arc<dyn UnitOfWorkFactory> {
        &self.database
    }

    /// Persists and publishes every uncommitted domain event, then commits.
    ///
    /// Events are inserted and published one at a time in buffer order. The
    /// buffer is cleared only once the commit succeeds; on any failure the
    /// unit of work is rolled back and the buffer is left as it was.
    /// Handlers that already ran for earlier events are not compensated.
    ///
    /// # Errors
    ///
    /// Returns the first codec, storage, handler or commit error.
    /// `ConcurrencyConflict` means another writer already stored one of
    /// these versions.
    #[instrument(skip(self, aggregate, cancel), fields(aggregate_id = %aggregate.aggregate_id()))]
    pub async fn append(
        &self,
        aggregate: &mut A,
        cancel: &CancellationToken,
    ) -> Result<Appended, PersistenceError> {
        self.append_events(aggregate, None, cancel).await
    }

    /// Like [`append`](Self::append), but first rejects the write when the
    /// store already holds an event past `expected_version`. The check runs
    /// in the same unit of work as the write.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::ConcurrencyConflict` when the aggregate
    /// moved on since it was loaded, otherwise as [`append`](Self::append).
    #[instrument(skip(self, aggregate, cancel), fields(aggregate_id = %aggregate.aggregate_id()))]
    pub async fn append_expecting(
        &self,
        aggregate: &mut A,
        expected_version: i64,
        cancel: &CancellationToken,
    ) -> Result<Appended, PersistenceError> {
        self.append_events(aggregate, Some(expected_version), cancel)
            .await
    }

    async fn append_events(
        &self,
        aggregate: &mut A,
        expected_version: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<Appended, PersistenceError> {
        if aggregate.uncommitted_events().is_empty() {
            debug!("no uncommitted events");
            return Ok(Appended::default());
        }

        let unit_of_work = self.database.begin();
        let outcome = async {
            if let Some(expected_version) = expected_version {
                Self::ensure_unchanged(
                    unit_of_work.as_ref(),
                    aggregate.aggregate_id(),
                    expected_version,
                    cancel,
                )
                .await?;
            }
            let events = self.write_events(unit_of_work.as_ref(), aggregate, cancel).await?;
            unit_of_work.commit(cancel).await?;
            Ok::<_, PersistenceError>(Appended {
                events,
                notifications: 0,
            })
        }
        .await;

        match outcome {
            Ok(appended) => {
                aggregate.clear_uncommitted_events();
                info!(events = appended.events, version = aggregate.version(), "aggregate appended");
                Ok(appended)
            }
            Err(error) => Err(abort(unit_of_work.as_ref(), error).await),
        }
    }

    /// Fails when `unit_of_work` already holds an event of the aggregate
    /// past `expected_version`.
    async fn ensure_unchanged(
        unit_of_work: &dyn UnitOfWork,
        aggregate_id: &AggregateId,
        expected_version: i64,
        cancel: &CancellationToken,
    ) -> Result<(), PersistenceError> {
        let newer = Criteria::for_aggregate(aggregate_id.clone())
            .of_type(A::AGGREGATE_TYPE)
            .after_version(expected_version);
        let newer = unit_of_work.events().count(&newer, cancel).await?;
        if newer > 0 {
            warn!(expected_version, newer, "aggregate changed since it was loaded");
            return Err(PersistenceError::ConcurrencyConflict {
                aggregate_id: aggregate_id.clone(),
                version: expected_version.saturating_add(1),
            });
        }
        Ok(())
    }

    /// Rebuilds the aggregate from its live event history.
    ///
    /// Returns `None` when the aggregate has no events.
    ///
    /// # Errors
    ///
    /// Returns `InstanceCreation` if the shell cannot be built, `Codec` if a
    /// stored payload does not decode, or a storage error.
    #[instrument(skip(self, cancel))]
    pub async fn read(
        &self,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<Option<A>, PersistenceError> {
        let criteria = Criteria::for_aggregate(aggregate_id.clone())
            .of_type(A::AGGREGATE_TYPE)
            .live();
        self.read_matching(&criteria, cancel).await
    }

    /// Rebuilds an aggregate by folding every event matching `criteria`.
    ///
    /// Rows are folded in version order whatever their timestamps. The
    /// shell is created for the aggregate id of the first matching row.
    /// Returns `None` when no rows match or the folded aggregate is still
    /// empty.
    ///
    /// # Errors
    ///
    /// As [`read`](Self::read).
    pub async fn read_matching(
        &self,
        criteria: &Criteria<StoredEvent>,
        cancel: &CancellationToken,
    ) -> Result<Option<A>, PersistenceError> {
        let criteria = criteria.clone().in_version_order();
        let unit_of_work = self.database.begin();
        let rows = unit_of_work.events().fetch_all(&criteria, cancel).await?;
        let Some(first) = rows.first() else {
            debug!("no events matched");
            return Ok(None);
        };

        let mut aggregate = self.factory.create(&first.aggregate_id)?;
        self.fold(&mut aggregate, &rows)?;
        debug!(events = rows.len(), version = aggregate.version(), "aggregate replayed");
        Ok((!aggregate.is_empty()).then_some(aggregate))
    }

    /// Fetches event rows of any stored flavor, paged per `criteria`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn read_events<T: StoreEntity>(
        &self,
        criteria: &Criteria<T>,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>, PersistenceError> {
        let unit_of_work = self.database.begin();
        T::store(unit_of_work.as_ref())
            .fetch_all(criteria, cancel)
            .await
    }

    /// Counts rows of any stored flavor. Paging is ignored.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn count_events<T: StoreEntity>(
        &self,
        criteria: &Criteria<T>,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError> {
        let unit_of_work = self.database.begin();
        T::store(unit_of_work.as_ref()).count(criteria, cancel).await
    }

    async fn write_events(
        &self,
        unit_of_work: &dyn UnitOfWork,
        aggregate: &A,
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        let events = aggregate.uncommitted_events();
        for event in events {
            let stored = self.to_stored_event(aggregate.aggregate_id(), event)?;
            debug!(event_type = %stored.event_type, version = stored.version, "inserting event");
            unit_of_work.events().insert(stored, cancel).await?;
            self.publisher.publish(event, cancel).await?;
        }
        Ok(events.len())
    }

    fn to_stored_event(
        &self,
        aggregate_id: &AggregateId,
        event: &A::Event,
    ) -> Result<StoredEvent, PersistenceError> {
        let meta = event.metadata();
        Ok(StoredEvent {
            event_id: meta.event_id,
            aggregate_id: aggregate_id.clone(),
            aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            event_type: event.event_type().to_owned(),
            event_name: event.event_name().to_owned(),
            event_data: self.codec.encode(event.event_type(), event.payload())?,
            version: meta.version,
            correlation_id: meta.correlation_id,
            causation_id: meta.causation_id,
            created_by: meta.created_by.clone(),
            occurred_on: meta.occurred_on,
            created_on: self.clock.now(),
            is_deleted: false,
            is_active: true,
        })
    }

    fn fold(&self, aggregate: &mut A, rows: &[StoredEvent]) -> Result<(), PersistenceError> {
        for row in rows {
            let payload = self.codec.decode(&row.event_type, &row.event_data)?;
            let metadata = EventMetadata {
                event_id: row.event_id,
                aggregate_id: row.aggregate_id.clone(),
                version: row.version,
                correlation_id: row.correlation_id,
                causation_id: row.causation_id,
                created_by: row.created_by.clone(),
                occurred_on: row.occurred_on,
            };
            aggregate.apply(&<A::Event as DomainEvent>::from_parts(metadata, payload));
        }
        Ok(())
    }

}

async fn abort(unit_of_work: &dyn UnitOfWork, error: PersistenceError) -> PersistenceError {
    if let Err(rollback_error) = unit_of_work.rollback().await {
        warn!(error = %rollback_error, "rollback failed");
    }
    warn!(error = %error, "unit of work rolled back");
    error
}

impl<A: NotificationOutbox, C: Codec> AggregatePersistenceService<A, C> {
    /// Persists domain events as [`append`](Self::append) does, then adds
    /// every uncommitted notification to the outbox, all in one commit.
    ///
    /// Notifications are never published here; the dispatcher delivers them.
    ///
    /// # Errors
    ///
    /// As [`append`](Self::append). Both buffers are left intact on failure.
    #[instrument(skip(self, aggregate, cancel), fields(aggregate_id = %aggregate.aggregate_id()))]
    pub async fn append_with_outbox(
        &self,
        aggregate: &mut A,
        cancel: &CancellationToken,
    ) -> Result<Appended, PersistenceError> {
        self.append_events_and_notifications(aggregate, None, cancel)
            .await
    }

    /// Like [`append_with_outbox`](Self::append_with_outbox), with the
    /// `expected_version` check of [`append_expecting`](Self::append_expecting).
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::ConcurrencyConflict` when the aggregate
    /// moved on since it was loaded, otherwise as
    /// [`append_with_outbox`](Self::append_with_outbox).
    #[instrument(skip(self, aggregate, cancel), fields(aggregate_id = %aggregate.aggregate_id()))]
    pub async fn append_with_outbox_expecting(
        &self,
        aggregate: &mut A,
        expected_version: i64,
        cancel: &CancellationToken,
    ) -> Result<Appended, PersistenceError> {
        self.append_events_and_notifications(aggregate, Some(expected_version), cancel)
            .await
    }

    async fn append_events_and_notifications(
        &self,
        aggregate: &mut A,
        expected_version: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<Appended, PersistenceError> {
        if aggregate.uncommitted_events().is_empty()
            && aggregate.uncommitted_notifications().is_empty()
        {
            debug!("no uncommitted events or notifications");
            return Ok(Appended::default());
        }

        let unit_of_work = self.database.begin();
        let outcome = async {
            if let Some(expected_version) = expected_version {
                Self::ensure_unchanged(
                    unit_of_work.as_ref(),
                    aggregate.aggregate_id(),
                    expected_version,
                    cancel,
                )
                .await?;
            }
            let events = self.write_events(unit_of_work.as_ref(), aggregate, cancel).await?;
            let notifications = self
                .write_notifications(unit_of_work.as_ref(), aggregate, cancel)
                .await?;
            unit_of_work.commit(cancel).await?;
            Ok::<_, PersistenceError>(Appended {
                events,
                notifications,
            })
        }
        .await;

        match outcome {
            Ok(appended) => {
                aggregate.clear_uncommitted_events();
                aggregate.clear_uncommitted_notifications();
                info!(
                    events = appended.events,
                    notifications = appended.notifications,
                    version = aggregate.version(),
                    "aggregate appended with outbox"
                );
                Ok(appended)
            }
            Err(error) => Err(abort(unit_of_work.as_ref(), error).await),
        }
    }

    async fn write_notifications(
        &self,
        unit_of_work: &dyn UnitOfWork,
        aggregate: &A,
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        let notifications = aggregate.uncommitted_notifications();
        for notification in notifications {
            let meta = notification.metadata();
            let stored = StoredNotification {
                notification_id: meta.notification_id,
                aggregate_id: aggregate.aggregate_id().clone(),
                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                notification_type: notification.notification_type().to_owned(),
                notification_name: notification.notification_name().to_owned(),
                data: self
                    .codec
                    .encode(notification.notification_type(), notification.payload())?,
                caused_by: meta.caused_by,
                version: meta.version,
                state: NotificationState::Pending,
                attempts: 0,
                exception: None,
                created_on: self.clock.now(),
                delivered_on: None,
                is_deleted: false,
                is_active: true,
            };
            debug!(notification_type = %stored.notification_type, "queueing notification");
            unit_of_work.notifications().insert(stored, cancel).await?;
        }
        Ok(notifications.len())
    }
}

impl<A: Originator, C: Codec> AggregatePersistenceService<A, C> {
    /// Stores a snapshot of the aggregate at its current version, replacing
    /// any snapshot already stored at that version, and commits.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an aggregate without history, otherwise a
    /// codec, storage or commit error.
    #[instrument(skip(self, aggregate, cancel), fields(aggregate_id = %aggregate.aggregate_id()))]
    pub async fn append_as_snapshot(
        &self,
        aggregate: &A,
        cancel: &CancellationToken,
    ) -> Result<(), PersistenceError> {
        if aggregate.is_empty() {
            return Err(PersistenceError::Validation(format!(
                "cannot snapshot {} with no history",
                aggregate.aggregate_id()
            )));
        }

        let version = aggregate.version();
        let unit_of_work = self.database.begin();
        let outcome = async {
            let existing = Criteria::for_aggregate(aggregate.aggregate_id().clone())
                .of_type(A::AGGREGATE_TYPE)
                .at_version(version);
            let replaced = unit_of_work.snapshots().delete(&existing, cancel).await?;

            let snapshot = StoredSnapshot {
                snapshot_id: Uuid::new_v4(),
                aggregate_id: aggregate.aggregate_id().clone(),
                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                memento_type: A::MEMENTO_TYPE.to_owned(),
                data: self
                    .codec
                    .encode(A::MEMENTO_TYPE, &aggregate.create_memento())?,
                version,
                created_on: self.clock.now(),
                is_deleted: false,
                is_active: true,
            };
            unit_of_work.snapshots().insert(snapshot, cancel).await?;
            unit_of_work.commit(cancel).await?;
            Ok::<_, PersistenceError>(replaced)
        }
        .await;

        match outcome {
            Ok(replaced) => {
                info!(version, replaced, "snapshot stored");
                Ok(())
            }
            Err(error) => Err(abort(unit_of_work.as_ref(), error).await),
        }
    }

    /// Restores the aggregate from its most recent snapshot.
    ///
    /// Events recorded after the snapshot are not applied; see
    /// [`load`](Self::load) for that.
    ///
    /// # Errors
    ///
    /// Returns `InstanceCreation`, `Codec` or a storage error.
    pub async fn read_from_snapshot(
        &self,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<Option<A>, PersistenceError> {
        self.read_from_snapshot_at(aggregate_id, None, cancel).await
    }

    /// Restores the aggregate from the highest snapshot version that does
    /// not exceed `max_version` (any version when `None`).
    ///
    /// # Errors
    ///
    /// As [`read_from_snapshot`](Self::read_from_snapshot).
    #[instrument(skip(self, cancel))]
    pub async fn read_from_snapshot_at(
        &self,
        aggregate_id: &AggregateId,
        max_version: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<Option<A>, PersistenceError> {
        let unit_of_work = self.database.begin();
        let Some(snapshot) = self
            .latest_snapshot(unit_of_work.as_ref(), aggregate_id, max_version, cancel)
            .await?
        else {
            debug!("no snapshot found");
            return Ok(None);
        };
        self.restore(&snapshot).map(Some)
    }

    /// Restores the latest snapshot and replays only the events after it.
    /// Falls back to a full replay when the aggregate has no snapshot.
    ///
    /// # Errors
    ///
    /// As [`read`](Self::read).
    #[instrument(skip(self, cancel))]
    pub async fn load(
        &self,
        aggregate_id: &AggregateId,
        cancel: &CancellationToken,
    ) -> Result<Option<A>, PersistenceError> {
        let unit_of_work = self.database.begin();
        let Some(snapshot) = self
            .latest_snapshot(unit_of_work.as_ref(), aggregate_id, None, cancel)
            .await?
        else {
            return self.read(aggregate_id, cancel).await;
        };

        let mut aggregate = self.restore(&snapshot)?;
        let delta = Criteria::for_aggregate(aggregate_id.clone())
            .of_type(A::AGGREGATE_TYPE)
            .live()
            .after_version(snapshot.version)
            .in_version_order();
        let rows = unit_of_work.events().fetch_all(&delta, cancel).await?;
        self.fold(&mut aggregate, &rows)?;
        debug!(
            snapshot_version = snapshot.version,
            replayed = rows.len(),
            version = aggregate.version(),
            "aggregate loaded from snapshot"
        );
        Ok(Some(aggregate))
    }

    async fn latest_snapshot(
        &self,
        unit_of_work: &dyn UnitOfWork,
        aggregate_id: &AggregateId,
        max_version: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<Option<StoredSnapshot>, PersistenceError> {
        let mut criteria = Criteria::for_aggregate(aggregate_id.clone())
            .of_type(A::AGGREGATE_TYPE)
            .live()
            .after_version(0);
        if let Some(max_version) = max_version {
            criteria = criteria.up_to_version(max_version);
        }
        let rows = unit_of_work.snapshots().fetch_all(&criteria, cancel).await?;
        Ok(rows.into_iter().max_by_key(|row| row.version))
    }

    fn restore(&self, snapshot: &StoredSnapshot) -> Result<A, PersistenceError> {
        let mut aggregate = self.factory.create(&snapshot.aggregate_id)?;
        let memento = self.codec.decode(&snapshot.memento_type, &snapshot.data)?;
        aggregate.set_memento(memento, snapshot.version);
        Ok(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chronicle_event_store::InMemoryDatabase;
    use chronicle_test_support::{
        FailingFactory, FixedClock, FlakyDatabase, SteppingClock, Tally, TallyEvent, TallyMemento,
    };

    use super::*;

    #[derive(Debug, Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(&'static str, i64)>>,
        fail_on_version: Option<i64>,
    }

    impl RecordingPublisher {
        fn failing_on(version: i64) -> Self {
            Self {
                published: Mutex::default(),
                fail_on_version: Some(version),
            }
        }

        fn published(&self) -> Vec<(&'static str, i64)> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher<TallyEvent> for RecordingPublisher {
        async fn publish(
            &self,
            event: &TallyEvent,
            _cancel: &CancellationToken,
        ) -> Result<(), PersistenceError> {
            let version = event.metadata().version;
            if self.fail_on_version == Some(version) {
                return Err(PersistenceError::Handler(format!("rejected version {version}")));
            }
            self.published
                .lock()
                .unwrap()
                .push((event.event_type(), version));
            Ok(())
        }
    }

    /// Yields before every event so concurrent appends interleave, and
    /// rejects every event of aggregate "bad".
    #[derive(Debug, Default)]
    struct YieldingPublisher;

    #[async_trait]
    impl EventPublisher<TallyEvent> for YieldingPublisher {
        async fn publish(
            &self,
            event: &TallyEvent,
            _cancel: &CancellationToken,
        ) -> Result<(), PersistenceError> {
            tokio::task::yield_now().await;
            if event.metadata().aggregate_id.as_str() == "bad" {
                return Err(PersistenceError::Handler("rejected aggregate bad".into()));
            }
            Ok(())
        }
    }

    struct Harness {
        db: InMemoryDatabase,
        publisher: Arc<RecordingPublisher>,
        service: AggregatePersistenceService<Tally>,
        clock: FixedClock,
        cancel: CancellationToken,
    }

    fn harness() -> Harness {
        harness_with(RecordingPublisher::default())
    }

    fn harness_with(publisher: RecordingPublisher) -> Harness {
        let db = InMemoryDatabase::new();
        let publisher = Arc::new(publisher);
        let clock = FixedClock::noon();
        let service = AggregatePersistenceService::<Tally>::new(
            Arc::new(db.clone()),
            publisher.clone(),
            Arc::new(Tally::shell),
        )
        .with_clock(Arc::new(clock));
        Harness {
            db,
            publisher,
            service,
            clock,
            cancel: CancellationToken::new(),
        }
    }

    fn id(value: &str) -> AggregateId {
        AggregateId::from(value)
    }

    #[tokio::test]
    async fn test_read_after_append_replays_three_events() {
        // Arrange
        let h = harness();
        let mut tally = Tally::new("t-1");
        tally.increment(2, &h.clock);
        tally.increment(3, &h.clock);
        tally.increment(5, &h.clock);

        // Act
        let appended = h.service.append(&mut tally, &h.cancel).await.unwrap();
        let restored = h.service.read(&id("t-1"), &h.cancel).await.unwrap();

        // Assert
        assert_eq!(appended.events, 3);
        let restored = restored.expect("aggregate should exist");
        assert_eq!(restored.version(), 3);
        assert_eq!(restored.total(), 10);
        assert!(tally.uncommitted_events().is_empty());
    }

    #[tokio::test]
    async fn test_read_unknown_aggregate_returns_none() {
        let h = harness();

        let restored = h.service.read(&id("missing"), &h.cancel).await.unwrap();

        assert!(restored.is_none());
    }

    #[tokio::test]
    async fn test_second_append_without_new_events_writes_nothing() {
        // Arrange
        let h = harness();
        let mut tally = Tally::new("t-1");
        tally.increment(1, &h.clock);
        h.service.append(&mut tally, &h.cancel).await.unwrap();

        // Act
        let second = h.service.append(&mut tally, &h.cancel).await.unwrap();

        // Assert
        assert!(second.is_empty());
        assert_eq!(h.db.committed_events().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_appended_versions_strictly_increase() {
        // Arrange
        let h = harness();
        let mut tally = Tally::new("t-1");
        for amount in 1..=4 {
            tally.increment(amount, &h.clock);
        }

        // Act
        h.service.append(&mut tally, &h.cancel).await.unwrap();
        tally.reset(&h.clock);
        h.service.append(&mut tally, &h.cancel).await.unwrap();

        // Assert
        let versions: Vec<i64> = h
            .db
            .committed_events()
            .unwrap()
            .iter()
            .map(|row| row.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_append_publishes_each_event_in_order() {
        // Arrange
        let h = harness();
        let mut tally = Tally::new("t-1");
        tally.increment(1, &h.clock);
        tally.reset(&h.clock);

        // Act
        h.service.append(&mut tally, &h.cancel).await.unwrap();

        // Assert
        assert_eq!(
            h.publisher.published(),
            vec![(TallyEvent::INCREMENTED, 1), (TallyEvent::RESET, 2)]
        );
    }

    #[tokio::test]
    async fn test_outbox_notifications_are_stored_but_not_published() {
        // Arrange
        let h = harness();
        let mut tally = Tally::new("t-1");
        tally.increment(1, &h.clock);
        tally.increment(1, &h.clock);
        tally.announce("two reached", &h.clock);

        // Act
        let appended = h
            .service
            .append_with_outbox(&mut tally, &h.cancel)
            .await
            .unwrap();

        // Assert
        assert_eq!(appended, Appended { events: 2, notifications: 1 });
        assert_eq!(h.publisher.published().len(), 2);
        let outbox = h.db.committed_notifications().unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].notification_type, "tally.announced");
        assert_eq!(outbox[0].state, NotificationState::Pending);
        assert!(tally.uncommitted_notifications().is_empty());
    }

    #[tokio::test]
    async fn test_handler_failure_rolls_back_and_keeps_buffer() {
        // Arrange
        let h = harness_with(RecordingPublisher::failing_on(2));
        let mut tally = Tally::new("t-1");
        tally.increment(1, &h.clock);
        tally.increment(1, &h.clock);

        // Act
        let result = h.service.append(&mut tally, &h.cancel).await;

        // Assert
        assert!(matches!(result, Err(PersistenceError::Handler(_))));
        assert_eq!(tally.uncommitted_events().len(), 2);
        let stored = h
            .service
            .count_events(&Criteria::<StoredEvent>::all(), &h.cancel)
            .await
            .unwrap();
        assert_eq!(stored, 0);
    }

    #[tokio::test]
    async fn test_commit_failure_keeps_buffers_for_retry() {
        // Arrange
        let db = FlakyDatabase::new();
        let clock = FixedClock::noon();
        let service = AggregatePersistenceService::<Tally>::new(
            Arc::new(db.clone()),
            Arc::new(RecordingPublisher::default()),
            Arc::new(Tally::shell),
        );
        let cancel = CancellationToken::new();
        let mut tally = Tally::new("t-1");
        tally.increment(7, &clock);
        tally.announce("seven", &clock);
        db.fail_next_commits(1);

        // Act
        let first = service.append_with_outbox(&mut tally, &cancel).await;
        let second = service.append_with_outbox(&mut tally, &cancel).await;

        // Assert
        assert!(matches!(first, Err(PersistenceError::Commit(_))));
        assert_eq!(db.rollbacks(), 1);
        assert_eq!(second.unwrap(), Appended { events: 1, notifications: 1 });
        assert_eq!(db.inner().committed_events().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_writer_gets_concurrency_conflict() {
        // Arrange
        let h = harness();
        let mut original = Tally::new("t-1");
        original.increment(1, &h.clock);
        h.service.append(&mut original, &h.cancel).await.unwrap();

        let mut first = h.service.read(&id("t-1"), &h.cancel).await.unwrap().unwrap();
        let mut second = h.service.read(&id("t-1"), &h.cancel).await.unwrap().unwrap();
        first.increment(10, &h.clock);
        second.increment(20, &h.clock);
        h.service.append(&mut first, &h.cancel).await.unwrap();

        // Act
        let result = h.service.append(&mut second, &h.cancel).await;

        // Assert
        assert!(matches!(
            result,
            Err(PersistenceError::ConcurrencyConflict { version: 2, .. })
        ));
        let restored = h.service.read(&id("t-1"), &h.cancel).await.unwrap().unwrap();
        assert_eq!(restored.total(), 11);
    }

    #[tokio::test]
    async fn test_append_expecting_rejects_moved_aggregate() {
        // Arrange
        let h = harness();
        let mut tally = Tally::new("t-1");
        tally.increment(1, &h.clock);
        tally.increment(1, &h.clock);
        h.service.append(&mut tally, &h.cancel).await.unwrap();
        tally.increment(1, &h.clock);

        // Act
        let result = h.service.append_expecting(&mut tally, 1, &h.cancel).await;

        // Assert
        assert!(matches!(
            result,
            Err(PersistenceError::ConcurrencyConflict { version: 2, .. })
        ));
        assert_eq!(tally.uncommitted_events().len(), 1);
    }

    #[tokio::test]
    async fn test_append_expecting_max_version_does_not_overflow() {
        // Arrange
        let h = harness();
        let mut tally = Tally::new("t-1");
        tally.increment(1, &h.clock);

        // Act
        let appended = h
            .service
            .append_expecting(&mut tally, i64::MAX, &h.cancel)
            .await
            .unwrap();

        // Assert
        assert_eq!(appended.events, 1);
    }

    #[tokio::test]
    async fn test_outbox_append_expecting_rejects_moved_aggregate() {
        // Arrange
        let h = harness();
        let mut tally = Tally::new("t-1");
        tally.increment(1, &h.clock);
        h.service.append(&mut tally, &h.cancel).await.unwrap();
        let mut stale = h.service.read(&id("t-1"), &h.cancel).await.unwrap().unwrap();
        tally.increment(1, &h.clock);
        h.service.append(&mut tally, &h.cancel).await.unwrap();
        stale.announce("stale", &h.clock);

        // Act
        let result = h
            .service
            .append_with_outbox_expecting(&mut stale, 1, &h.cancel)
            .await;

        // Assert
        assert!(matches!(
            result,
            Err(PersistenceError::ConcurrencyConflict { version: 2, .. })
        ));
        assert_eq!(stale.uncommitted_notifications().len(), 1);
        assert!(h.db.committed_notifications().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_appends_commit_only_their_own_rows() {
        // Arrange
        let db = InMemoryDatabase::new();
        let clock = FixedClock::noon();
        let service = AggregatePersistenceService::<Tally>::new(
            Arc::new(db.clone()),
            Arc::new(YieldingPublisher),
            Arc::new(Tally::shell),
        )
        .with_clock(Arc::new(clock));
        let cancel = CancellationToken::new();
        let mut good = Tally::new("good");
        good.increment(1, &clock);
        good.increment(2, &clock);
        let mut bad = Tally::new("bad");
        bad.increment(5, &clock);
        bad.increment(6, &clock);

        // Act
        let (good_result, bad_result) = tokio::join!(
            service.append(&mut good, &cancel),
            service.append(&mut bad, &cancel)
        );

        // Assert
        assert_eq!(good_result.unwrap().events, 2);
        assert!(matches!(bad_result, Err(PersistenceError::Handler(_))));
        assert_eq!(bad.uncommitted_events().len(), 2);
        let committed = db.committed_events().unwrap();
        assert_eq!(
            committed.iter().map(|row| row.version).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(committed.iter().all(|row| row.aggregate_id == id("good")));
    }

    #[tokio::test]
    async fn test_replay_follows_versions_when_clock_runs_backwards() {
        // Arrange
        let db = InMemoryDatabase::new();
        let clock = FixedClock::noon();
        let service = AggregatePersistenceService::<Tally>::new(
            Arc::new(db.clone()),
            Arc::new(RecordingPublisher::default()),
            Arc::new(Tally::shell),
        )
        .with_clock(Arc::new(SteppingClock::new(
            clock.0,
            chrono::Duration::seconds(-1),
        )));
        let cancel = CancellationToken::new();
        let mut tally = Tally::new("t-1");
        tally.increment(5, &clock);
        tally.reset(&clock);
        tally.increment(2, &clock);
        service.append(&mut tally, &cancel).await.unwrap();
        service.append_as_snapshot(&tally, &cancel).await.unwrap();
        tally.increment(1, &clock);
        tally.increment(1, &clock);
        service.append(&mut tally, &cancel).await.unwrap();

        // Act
        let restored = service.read(&id("t-1"), &cancel).await.unwrap().unwrap();
        let loaded = service.load(&id("t-1"), &cancel).await.unwrap().unwrap();

        // Assert
        let committed = db.committed_events().unwrap();
        assert!(committed[0].created_on > committed[4].created_on);
        assert_eq!((restored.version(), restored.total()), (5, 4));
        assert_eq!((loaded.version(), loaded.total()), (5, 4));
    }

    #[tokio::test]
    async fn test_factory_failure_surfaces_as_instance_creation() {
        // Arrange
        let db = Arc::new(InMemoryDatabase::new());
        let clock = FixedClock::noon();
        let cancel = CancellationToken::new();
        let writer = AggregatePersistenceService::<Tally>::new(
            db.clone(),
            Arc::new(RecordingPublisher::default()),
            Arc::new(Tally::shell),
        );
        let mut tally = Tally::new("t-1");
        tally.increment(1, &clock);
        writer.append(&mut tally, &cancel).await.unwrap();
        let reader = AggregatePersistenceService::<Tally>::new(
            db,
            Arc::new(RecordingPublisher::default()),
            Arc::new(FailingFactory::default()),
        );

        // Act
        let result = reader.read(&id("t-1"), &cancel).await;

        // Assert
        assert!(matches!(result, Err(PersistenceError::InstanceCreation(_))));
    }

    #[tokio::test]
    async fn test_snapshot_twice_at_same_version_leaves_one_row() {
        // Arrange
        let h = harness();
        let mut tally = Tally::new("t-1");
        for _ in 0..5 {
            tally.increment(2, &h.clock);
        }
        h.service.append(&mut tally, &h.cancel).await.unwrap();

        // Act
        h.service.append_as_snapshot(&tally, &h.cancel).await.unwrap();
        h.service.append_as_snapshot(&tally, &h.cancel).await.unwrap();

        // Assert
        let rows = h.db.committed_snapshots().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].version, 5);
        assert_eq!(rows[0].memento_type, "tally.memento");
    }

    #[tokio::test]
    async fn test_snapshot_of_empty_aggregate_is_rejected() {
        let h = harness();

        let result = h
            .service
            .append_as_snapshot(&Tally::new("t-1"), &h.cancel)
            .await;

        assert!(matches!(result, Err(PersistenceError::Validation(_))));
    }

    #[tokio::test]
    async fn test_read_from_snapshot_picks_highest_version_within_ceiling() {
        // Arrange
        let h = harness();
        let mut tally = Tally::new("t-1");
        for version in 1..=6 {
            tally.increment(1, &h.clock);
            if version % 2 == 0 {
                h.service.append(&mut tally, &h.cancel).await.unwrap();
                h.service.append_as_snapshot(&tally, &h.cancel).await.unwrap();
            }
        }

        // Act
        let latest = h
            .service
            .read_from_snapshot(&id("t-1"), &h.cancel)
            .await
            .unwrap()
            .unwrap();
        let capped = h
            .service
            .read_from_snapshot_at(&id("t-1"), Some(5), &h.cancel)
            .await
            .unwrap()
            .unwrap();

        // Assert
        assert_eq!((latest.version(), latest.total()), (6, 6));
        assert_eq!((capped.version(), capped.total()), (4, 4));
    }

    #[tokio::test]
    async fn test_read_from_snapshot_without_snapshot_returns_none() {
        let h = harness();

        let restored = h
            .service
            .read_from_snapshot(&id("t-1"), &h.cancel)
            .await
            .unwrap();

        assert!(restored.is_none());
    }

    #[tokio::test]
    async fn test_load_applies_events_recorded_after_snapshot() {
        // Arrange
        let h = harness();
        let mut tally = Tally::new("t-1");
        tally.increment(10, &h.clock);
        tally.increment(10, &h.clock);
        h.service.append(&mut tally, &h.cancel).await.unwrap();
        h.service.append_as_snapshot(&tally, &h.cancel).await.unwrap();
        tally.increment(5, &h.clock);
        h.service.append(&mut tally, &h.cancel).await.unwrap();

        // Act
        let loaded = h.service.load(&id("t-1"), &h.cancel).await.unwrap().unwrap();

        // Assert
        assert_eq!(loaded.version(), 3);
        assert_eq!(loaded.total(), 25);
    }

    #[tokio::test]
    async fn test_load_seeds_from_memento_not_history() {
        // Arrange
        let h = harness();
        let mut tally = Tally::new("t-1");
        tally.increment(1, &h.clock);
        h.service.append(&mut tally, &h.cancel).await.unwrap();
        let doctored = StoredSnapshot {
            snapshot_id: Uuid::new_v4(),
            aggregate_id: id("t-1"),
            aggregate_type: "tally".to_owned(),
            memento_type: "tally.memento".to_owned(),
            data: serde_json::to_value(TallyMemento { total: 100 }).unwrap(),
            version: 1,
            created_on: h.clock.now(),
            is_deleted: false,
            is_active: true,
        };
        let uow = h.db.unit_of_work();
        uow.snapshots().insert(doctored, &h.cancel).await.unwrap();
        uow.commit(&h.cancel).await.unwrap();

        // Act
        let loaded = h.service.load(&id("t-1"), &h.cancel).await.unwrap().unwrap();

        // Assert
        assert_eq!(loaded.total(), 100);
    }

    #[tokio::test]
    async fn test_load_without_snapshot_falls_back_to_full_replay() {
        let h = harness();
        let mut tally = Tally::new("t-1");
        tally.increment(4, &h.clock);
        h.service.append(&mut tally, &h.cancel).await.unwrap();

        let loaded = h.service.load(&id("t-1"), &h.cancel).await.unwrap().unwrap();

        assert_eq!(loaded.total(), 4);
    }

    #[tokio::test]
    async fn test_read_events_pages_event_log() {
        // Arrange
        let h = harness();
        let mut tally = Tally::new("t-1");
        for _ in 0..5 {
            tally.increment(1, &h.clock);
        }
        h.service.append(&mut tally, &h.cancel).await.unwrap();

        // Act
        let page = h
            .service
            .read_events(
                &Criteria::<StoredEvent>::for_aggregate("t-1").page(Some(2), Some(1)),
                &h.cancel,
            )
            .await
            .unwrap();
        let total = h
            .service
            .count_events(
                &Criteria::<StoredEvent>::for_aggregate("t-1").page(Some(2), Some(1)),
                &h.cancel,
            )
            .await
            .unwrap();

        // Assert
        assert_eq!(page.iter().map(|e| e.version).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn test_read_matching_filters_on_payload() {
        // Arrange
        let h = harness();
        let mut tally = Tally::new("t-1");
        tally.increment(1, &h.clock);
        tally.increment(50, &h.clock);
        h.service.append(&mut tally, &h.cancel).await.unwrap();
        let small = Criteria::for_aggregate("t-1").matching(|row: &StoredEvent| {
            row.event_data["Incremented"]["amount"].as_i64() == Some(1)
        });

        // Act
        let partial = h.service.read_matching(&small, &h.cancel).await.unwrap().unwrap();

        // Assert
        assert_eq!(partial.total(), 1);
        assert_eq!(partial.version(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_append_leaves_buffer_intact() {
        let h = harness();
        let mut tally = Tally::new("t-1");
        tally.increment(1, &h.clock);
        h.cancel.cancel();

        let result = h.service.append(&mut tally, &h.cancel).await;

        assert!(matches!(result, Err(PersistenceError::Cancelled)));
        assert_eq!(tally.uncommitted_events().len(), 1);
    }
}
