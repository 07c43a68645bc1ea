//! In-process storage.
//!
//! [`InMemoryDatabase`] owns the committed rows of the three logs behind one
//! lock. Every [`InMemoryUnitOfWork`] it begins stages its own inserts,
//! updates and deletes on top of that state. Reads see committed rows with
//! the staged changes applied, matching the read-your-writes behavior of an
//! open database transaction. `commit` re-checks event versions against rows
//! committed in the meantime, then applies every log or none.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chronicle_core::criteria::Criteria;
use chronicle_core::entity::{StoreEntity, StoredEvent, StoredNotification, StoredSnapshot};
use chronicle_core::error::PersistenceError;
use chronicle_core::store::{EntityStore, UnitOfWork, UnitOfWorkFactory};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Committed {
    events: Vec<StoredEvent>,
    notifications: Vec<StoredNotification>,
    snapshots: Vec<StoredSnapshot>,
}

/// Where one stored flavor lives in [`Committed`].
trait MemoryRecord: StoreEntity {
    /// Whether `(aggregate_type, aggregate_id, version)` is unique.
    const UNIQUE_VERSION: bool;

    fn rows(committed: &Committed) -> &[Self];
}

impl MemoryRecord for StoredEvent {
    const UNIQUE_VERSION: bool = true;

    fn rows(committed: &Committed) -> &[Self] {
        &committed.events
    }
}

impl MemoryRecord for StoredNotification {
    const UNIQUE_VERSION: bool = false;

    fn rows(committed: &Committed) -> &[Self] {
        &committed.notifications
    }
}

impl MemoryRecord for StoredSnapshot {
    const UNIQUE_VERSION: bool = false;

    fn rows(committed: &Committed) -> &[Self] {
        &committed.snapshots
    }
}

fn lock<V>(mutex: &Mutex<V>) -> Result<MutexGuard<'_, V>, PersistenceError> {
    mutex
        .lock()
        .map_err(|_| PersistenceError::Storage("in-memory store lock poisoned".into()))
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), PersistenceError> {
    if cancel.is_cancelled() {
        Err(PersistenceError::Cancelled)
    } else {
        Ok(())
    }
}

fn same_version<T: StoreEntity>(a: &T, b: &T) -> bool {
    a.aggregate_id() == b.aggregate_id()
        && a.aggregate_type() == b.aggregate_type()
        && a.version() == b.version()
}

/// Changes one unit of work has made to one log.
#[derive(Debug)]
struct Staged<T> {
    inserted: Vec<T>,
    updated: Vec<T>,
    deleted: HashSet<Uuid>,
}

impl<T> Default for Staged<T> {
    fn default() -> Self {
        Self {
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: HashSet::new(),
        }
    }
}

impl<T: StoreEntity> Staged<T> {
    fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Committed rows with the staged changes applied, in insertion order.
    fn view(&self, committed: &[T]) -> Vec<T> {
        committed
            .iter()
            .filter(|row| !self.deleted.contains(&row.id()))
            .map(|row| {
                self.updated
                    .iter()
                    .find(|update| update.id() == row.id())
                    .unwrap_or(row)
                    .clone()
            })
            .chain(self.inserted.iter().cloned())
            .collect()
    }

    /// Checks the staged changes still fit `committed`.
    fn validate(&self, committed: &[T], unique_versions: bool) -> Result<(), PersistenceError> {
        if unique_versions {
            let taken = self.inserted.iter().find(|row| {
                committed
                    .iter()
                    .any(|existing| !self.deleted.contains(&existing.id()) && same_version(existing, row))
            });
            if let Some(row) = taken {
                return Err(PersistenceError::ConcurrencyConflict {
                    aggregate_id: row.aggregate_id().clone(),
                    version: row.version(),
                });
            }
        }
        if let Some(missing) = self
            .updated
            .iter()
            .find(|update| !committed.iter().any(|row| row.id() == update.id()))
        {
            return Err(PersistenceError::Storage(format!(
                "no row with id {}",
                missing.id()
            )));
        }
        Ok(())
    }

    /// Moves the staged changes into `committed` and returns how many rows
    /// were touched.
    fn apply_to(&mut self, committed: &mut Vec<T>) -> usize {
        let touched = self.inserted.len() + self.updated.len() + self.deleted.len();
        committed.retain(|row| !self.deleted.contains(&row.id()));
        for update in self.updated.drain(..) {
            if let Some(slot) = committed.iter_mut().find(|row| row.id() == update.id()) {
                *slot = update;
            }
        }
        committed.append(&mut self.inserted);
        self.deleted.clear();
        touched
    }
}

/// One log as seen from one unit of work.
#[derive(Debug)]
struct MemoryLog<T> {
    committed: Arc<Mutex<Committed>>,
    staged: Mutex<Staged<T>>,
}

impl<T: MemoryRecord> MemoryLog<T> {
    fn new(committed: Arc<Mutex<Committed>>) -> Self {
        Self {
            committed,
            staged: Mutex::new(Staged::default()),
        }
    }

    fn discard(&self) -> Result<(), PersistenceError> {
        *lock(&self.staged)? = Staged::default();
        Ok(())
    }
}

#[async_trait]
impl<T: MemoryRecord> EntityStore<T> for MemoryLog<T> {
    async fn insert(&self, entity: T, cancel: &CancellationToken) -> Result<(), PersistenceError> {
        ensure_live(cancel)?;
        let committed = lock(&self.committed)?;
        let mut staged = lock(&self.staged)?;
        if T::UNIQUE_VERSION
            && staged
                .view(T::rows(&committed))
                .iter()
                .any(|row| same_version(row, &entity))
        {
            return Err(PersistenceError::ConcurrencyConflict {
                aggregate_id: entity.aggregate_id().clone(),
                version: entity.version(),
            });
        }
        debug!(id = %entity.id(), aggregate_id = %entity.aggregate_id(), "staged row");
        staged.inserted.push(entity);
        Ok(())
    }

    async fn fetch_all(
        &self,
        criteria: &Criteria<T>,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>, PersistenceError> {
        ensure_live(cancel)?;
        let committed = lock(&self.committed)?;
        let staged = lock(&self.staged)?;
        Ok(criteria.apply(staged.view(T::rows(&committed))))
    }

    async fn count(
        &self,
        criteria: &Criteria<T>,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError> {
        ensure_live(cancel)?;
        let committed = lock(&self.committed)?;
        let staged = lock(&self.staged)?;
        Ok(criteria.count_matches(&staged.view(T::rows(&committed))) as u64)
    }

    async fn delete(
        &self,
        criteria: &Criteria<T>,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError> {
        ensure_live(cancel)?;
        let committed = lock(&self.committed)?;
        let mut staged = lock(&self.staged)?;
        let doomed: Vec<Uuid> = staged
            .view(T::rows(&committed))
            .iter()
            .filter(|row| criteria.matches(row))
            .map(T::id)
            .collect();
        for id in &doomed {
            if let Some(position) = staged.inserted.iter().position(|row| row.id() == *id) {
                staged.inserted.remove(position);
            } else {
                staged.updated.retain(|row| row.id() != *id);
                staged.deleted.insert(*id);
            }
        }
        Ok(doomed.len() as u64)
    }

    async fn update(&self, entity: T, cancel: &CancellationToken) -> Result<(), PersistenceError> {
        ensure_live(cancel)?;
        let committed = lock(&self.committed)?;
        let mut staged = lock(&self.staged)?;
        let id = entity.id();
        if let Some(slot) = staged.inserted.iter_mut().find(|row| row.id() == id) {
            *slot = entity;
            return Ok(());
        }
        let exists = !staged.deleted.contains(&id) && T::rows(&committed).iter().any(|row| row.id() == id);
        if !exists {
            return Err(PersistenceError::Storage(format!("no row with id {id}")));
        }
        staged.updated.retain(|row| row.id() != id);
        staged.updated.push(entity);
        Ok(())
    }
}

/// Committed rows of the three logs, shared by every unit of work begun
/// from it. Clones share the same rows.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    committed: Arc<Mutex<Committed>>,
}

impl InMemoryDatabase {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a unit of work with nothing staged.
    #[must_use]
    pub fn unit_of_work(&self) -> InMemoryUnitOfWork {
        InMemoryUnitOfWork {
            committed: Arc::clone(&self.committed),
            events: MemoryLog::new(Arc::clone(&self.committed)),
            notifications: MemoryLog::new(Arc::clone(&self.committed)),
            snapshots: MemoryLog::new(Arc::clone(&self.committed)),
        }
    }

    /// Committed events in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::Storage` if the store lock is poisoned.
    pub fn committed_events(&self) -> Result<Vec<StoredEvent>, PersistenceError> {
        Ok(lock(&self.committed)?.events.clone())
    }

    /// Committed outbox rows in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::Storage` if the store lock is poisoned.
    pub fn committed_notifications(&self) -> Result<Vec<StoredNotification>, PersistenceError> {
        Ok(lock(&self.committed)?.notifications.clone())
    }

    /// Committed snapshots in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::Storage` if the store lock is poisoned.
    pub fn committed_snapshots(&self) -> Result<Vec<StoredSnapshot>, PersistenceError> {
        Ok(lock(&self.committed)?.snapshots.clone())
    }
}

impl UnitOfWorkFactory for InMemoryDatabase {
    fn begin(&self) -> Box<dyn UnitOfWork> {
        Box::new(self.unit_of_work())
    }
}

/// Unit of work backed by an [`InMemoryDatabase`].
#[derive(Debug)]
pub struct InMemoryUnitOfWork {
    committed: Arc<Mutex<Committed>>,
    events: MemoryLog<StoredEvent>,
    notifications: MemoryLog<StoredNotification>,
    snapshots: MemoryLog<StoredSnapshot>,
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    fn events(&self) -> &dyn EntityStore<StoredEvent> {
        &self.events
    }

    fn notifications(&self) -> &dyn EntityStore<StoredNotification> {
        &self.notifications
    }

    fn snapshots(&self) -> &dyn EntityStore<StoredSnapshot> {
        &self.snapshots
    }

    async fn commit(&self, cancel: &CancellationToken) -> Result<(), PersistenceError> {
        ensure_live(cancel)?;
        let mut committed = lock(&self.committed)?;
        let mut events = lock(&self.events.staged)?;
        let mut notifications = lock(&self.notifications.staged)?;
        let mut snapshots = lock(&self.snapshots.staged)?;
        if events.is_empty() && notifications.is_empty() && snapshots.is_empty() {
            return Ok(());
        }

        events.validate(&committed.events, StoredEvent::UNIQUE_VERSION)?;
        notifications.validate(&committed.notifications, StoredNotification::UNIQUE_VERSION)?;
        snapshots.validate(&committed.snapshots, StoredSnapshot::UNIQUE_VERSION)?;

        let events = events.apply_to(&mut committed.events);
        let notifications = notifications.apply_to(&mut committed.notifications);
        let snapshots = snapshots.apply_to(&mut committed.snapshots);
        debug!(events, notifications, snapshots, "in-memory unit of work committed");
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PersistenceError> {
        self.events.discard()?;
        self.notifications.discard()?;
        self.snapshots.discard()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use chronicle_core::id::AggregateId;
    use uuid::Uuid;

    use super::*;

    fn stored_event(aggregate_id: &str, version: i64) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::new_v4(),
            aggregate_id: AggregateId::from(aggregate_id),
            aggregate_type: "account".to_owned(),
            event_type: "account.deposited".to_owned(),
            event_name: "deposited".to_owned(),
            event_data: serde_json::json!({"Deposited": {"amount": version}}),
            version,
            correlation_id: Uuid::new_v4(),
            causation_id: Uuid::new_v4(),
            created_by: "tester".to_owned(),
            occurred_on: Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
            created_on: Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
            is_deleted: false,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_staged_rows_are_visible_before_commit_but_not_committed() {
        // Arrange
        let db = InMemoryDatabase::new();
        let uow = db.unit_of_work();
        let cancel = CancellationToken::new();

        // Act
        uow.events()
            .insert(stored_event("a-1", 1), &cancel)
            .await
            .unwrap();

        // Assert
        let visible = uow
            .events()
            .fetch_all(&Criteria::for_aggregate("a-1"), &cancel)
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);
        assert!(db.committed_events().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_promotes_and_rollback_discards() {
        // Arrange
        let db = InMemoryDatabase::new();
        let uow = db.unit_of_work();
        let cancel = CancellationToken::new();
        uow.events()
            .insert(stored_event("a-1", 1), &cancel)
            .await
            .unwrap();
        uow.commit(&cancel).await.unwrap();

        // Act
        uow.events()
            .insert(stored_event("a-1", 2), &cancel)
            .await
            .unwrap();
        uow.rollback().await.unwrap();

        // Assert
        let count = uow
            .events()
            .count(&Criteria::for_aggregate("a-1"), &cancel)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(db.committed_events().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_units_of_work_do_not_see_each_others_staged_rows() {
        // Arrange
        let db = InMemoryDatabase::new();
        let writer = db.unit_of_work();
        let reader = db.unit_of_work();
        let cancel = CancellationToken::new();
        writer
            .events()
            .insert(stored_event("a-1", 1), &cancel)
            .await
            .unwrap();

        // Act
        let before = reader.events().count(&Criteria::all(), &cancel).await.unwrap();
        reader.rollback().await.unwrap();
        writer.commit(&cancel).await.unwrap();
        let after = reader.events().count(&Criteria::all(), &cancel).await.unwrap();

        // Assert
        assert_eq!(before, 0);
        assert_eq!(after, 1);
        assert_eq!(db.committed_events().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_rechecks_versions_committed_meanwhile() {
        // Arrange
        let db = InMemoryDatabase::new();
        let first = db.unit_of_work();
        let second = db.unit_of_work();
        let cancel = CancellationToken::new();
        first
            .events()
            .insert(stored_event("a-1", 1), &cancel)
            .await
            .unwrap();
        second
            .events()
            .insert(stored_event("a-1", 1), &cancel)
            .await
            .unwrap();
        second
            .events()
            .insert(stored_event("a-2", 1), &cancel)
            .await
            .unwrap();
        first.commit(&cancel).await.unwrap();

        // Act
        let result = second.commit(&cancel).await;

        // Assert
        assert!(matches!(
            result,
            Err(PersistenceError::ConcurrencyConflict { version: 1, .. })
        ));
        let committed = db.committed_events().unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].aggregate_id, AggregateId::from("a-1"));
    }

    #[tokio::test]
    async fn test_duplicate_event_version_is_a_concurrency_conflict() {
        // Arrange
        let uow = InMemoryDatabase::new().unit_of_work();
        let cancel = CancellationToken::new();
        uow.events()
            .insert(stored_event("a-1", 1), &cancel)
            .await
            .unwrap();

        // Act
        let result = uow.events().insert(stored_event("a-1", 1), &cancel).await;

        // Assert
        match result {
            Err(PersistenceError::ConcurrencyConflict {
                aggregate_id,
                version,
            }) => {
                assert_eq!(aggregate_id, AggregateId::from("a-1"));
                assert_eq!(version, 1);
            }
            other => panic!("expected ConcurrencyConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_all_pages_in_insertion_order_when_timestamps_tie() {
        // Arrange
        let uow = InMemoryDatabase::new().unit_of_work();
        let cancel = CancellationToken::new();
        for version in 1..=5 {
            uow.events()
                .insert(stored_event("a-1", version), &cancel)
                .await
                .unwrap();
        }

        // Act
        let page = uow
            .events()
            .fetch_all(&Criteria::all().page(Some(2), Some(1)), &cancel)
            .await
            .unwrap();

        // Assert
        assert_eq!(page.iter().map(|e| e.version).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_delete_and_update_touch_only_matching_rows() {
        // Arrange
        let db = InMemoryDatabase::new();
        let uow = db.unit_of_work();
        let cancel = CancellationToken::new();
        let mut first = stored_event("a-1", 1);
        uow.events().insert(first.clone(), &cancel).await.unwrap();
        uow.events()
            .insert(stored_event("a-1", 2), &cancel)
            .await
            .unwrap();
        uow.events()
            .insert(stored_event("a-1", 3), &cancel)
            .await
            .unwrap();
        uow.commit(&cancel).await.unwrap();
        uow.events()
            .insert(stored_event("a-1", 4), &cancel)
            .await
            .unwrap();

        // Act
        first.is_active = false;
        uow.events().update(first, &cancel).await.unwrap();
        let removed = uow
            .events()
            .delete(&Criteria::for_aggregate("a-1").after_version(2), &cancel)
            .await
            .unwrap();
        uow.commit(&cancel).await.unwrap();

        // Assert
        assert_eq!(removed, 2);
        let rows = db.committed_events().unwrap();
        assert_eq!(rows.iter().map(|e| e.version).collect::<Vec<_>>(), vec![1, 2]);
        assert!(!rows[0].is_active);
        assert!(rows[1].is_active);
    }

    #[tokio::test]
    async fn test_update_of_unknown_row_is_a_storage_error() {
        let uow = InMemoryDatabase::new().unit_of_work();

        let result = uow
            .events()
            .update(stored_event("a-1", 1), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(PersistenceError::Storage(_))));
    }

    #[tokio::test]
    async fn test_cancelled_token_rejects_store_calls() {
        let uow = InMemoryDatabase::new().unit_of_work();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = uow.events().insert(stored_event("a-1", 1), &cancel).await;

        assert!(matches!(result, Err(PersistenceError::Cancelled)));
    }
}
