//! Database whose units of work fail on demand.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chronicle_core::entity::{StoredEvent, StoredNotification, StoredSnapshot};
use chronicle_core::error::PersistenceError;
use chronicle_core::store::{EntityStore, UnitOfWork, UnitOfWorkFactory};
use chronicle_event_store::{InMemoryDatabase, InMemoryUnitOfWork};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct Counters {
    failing_commits: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

/// An in-memory database whose next `n` commits fail, across every unit of
/// work it begins.
///
/// A failed commit rolls nothing back by itself; callers are expected to
/// call `rollback` the way they would after a real database error.
#[derive(Debug, Clone, Default)]
pub struct FlakyDatabase {
    inner: InMemoryDatabase,
    counters: Arc<Counters>,
}

impl FlakyDatabase {
    /// Creates a database that behaves normally until told otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail with `PersistenceError::Commit`.
    pub fn fail_next_commits(&self, count: usize) {
        self.counters.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Successful commits so far.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.counters.commits.load(Ordering::SeqCst)
    }

    /// Rollbacks so far.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.counters.rollbacks.load(Ordering::SeqCst)
    }

    /// The wrapped database, for inspecting committed rows.
    #[must_use]
    pub fn inner(&self) -> &InMemoryDatabase {
        &self.inner
    }
}

impl UnitOfWorkFactory for FlakyDatabase {
    fn begin(&self) -> Box<dyn UnitOfWork> {
        Box::new(FlakyUnitOfWork {
            inner: self.inner.unit_of_work(),
            counters: Arc::clone(&self.counters),
        })
    }
}

#[derive(Debug)]
struct FlakyUnitOfWork {
    inner: InMemoryUnitOfWork,
    counters: Arc<Counters>,
}

#[async_trait]
impl UnitOfWork for FlakyUnitOfWork {
    fn events(&self) -> &dyn EntityStore<StoredEvent> {
        self.inner.events()
    }

    fn notifications(&self) -> &dyn EntityStore<StoredNotification> {
        self.inner.notifications()
    }

    fn snapshots(&self) -> &dyn EntityStore<StoredSnapshot> {
        self.inner.snapshots()
    }

    async fn commit(&self, cancel: &CancellationToken) -> Result<(), PersistenceError> {
        let should_fail = self
            .counters
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(PersistenceError::Commit("injected commit failure".into()));
        }
        self.inner.commit(cancel).await?;
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PersistenceError> {
        self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.inner.rollback().await
    }
}
