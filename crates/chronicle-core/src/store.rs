//! Store and unit-of-work abstractions.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::criteria::Criteria;
use crate::entity::{StoreEntity, StoredEvent, StoredNotification, StoredSnapshot};
use crate::error::PersistenceError;

/// Append-mostly log of one entity flavor, queryable by [`Criteria`].
#[async_trait]
pub trait EntityStore<T: StoreEntity>: Send + Sync {
    /// Appends one row. No deduplication beyond the store's own constraints.
    async fn insert(&self, entity: T, cancel: &CancellationToken) -> Result<(), PersistenceError>;

    /// Returns matching rows in the order `criteria` asks for, paged per `criteria`.
    async fn fetch_all(
        &self,
        criteria: &Criteria<T>,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>, PersistenceError>;

    /// Counts matching rows. Paging is ignored.
    async fn count(
        &self,
        criteria: &Criteria<T>,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError>;

    /// Removes matching rows and returns how many were removed.
    async fn delete(
        &self,
        criteria: &Criteria<T>,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError>;

    /// Replaces the row sharing `entity`'s id.
    async fn update(&self, entity: T, cancel: &CancellationToken) -> Result<(), PersistenceError>;
}

/// Transactional boundary bundling the three stores.
///
/// Writes made through the stores are visible to reads on the same unit of
/// work immediately and to everyone else after [`commit`](Self::commit).
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// The domain event log.
    fn events(&self) -> &dyn EntityStore<StoredEvent>;

    /// The outbox.
    fn notifications(&self) -> &dyn EntityStore<StoredNotification>;

    /// The snapshot store.
    fn snapshots(&self) -> &dyn EntityStore<StoredSnapshot>;

    /// Makes every staged write durable.
    async fn commit(&self, cancel: &CancellationToken) -> Result<(), PersistenceError>;

    /// Discards every staged write.
    async fn rollback(&self) -> Result<(), PersistenceError>;
}

/// Source of independent units of work over one backing store.
///
/// Every caller that writes begins its own unit of work, so one caller's
/// commit or rollback never touches another caller's staged rows.
pub trait UnitOfWorkFactory: Send + Sync {
    /// Opens a fresh unit of work with nothing staged.
    fn begin(&self) -> Box<dyn UnitOfWork>;
}

/// Runs `operation` unless `cancel` fires first.
///
/// # Errors
///
/// Returns `PersistenceError::Cancelled` if the token is or becomes cancelled,
/// otherwise whatever `operation` returns.
pub async fn cancellable<F, T>(cancel: &CancellationToken, operation: F) -> Result<T, PersistenceError>
where
    F: Future<Output = Result<T, PersistenceError>>,
{
    if cancel.is_cancelled() {
        return Err(PersistenceError::Cancelled);
    }
    cancel
        .run_until_cancelled(operation)
        .await
        .unwrap_or(Err(PersistenceError::Cancelled))
}
