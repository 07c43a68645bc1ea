//! `PostgreSQL` implementation of the `UnitOfWork` trait.
//!
//! [`PgDatabase`] hands out one [`PgUnitOfWork`] per caller. The first write
//! opens a transaction that every later call on the same unit of work
//! reuses; `commit` or `rollback` closes it, and dropping an uncommitted unit
//! of work rolls it back. Reads run inside the open transaction when there is
//! one so they see staged writes.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chronicle_core::criteria::Criteria;
use chronicle_core::entity::{
    NotificationState, StoreEntity, StoredEvent, StoredNotification, StoredSnapshot,
};
use chronicle_core::error::PersistenceError;
use chronicle_core::id::AggregateId;
use chronicle_core::store::{EntityStore, UnitOfWork, UnitOfWorkFactory, cancellable};
use sqlx::postgres::{PgQueryResult, PgRow};
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const UNIQUE_VIOLATION: &str = "23505";

/// Row mapping for one stored flavor.
trait PgRecord: StoreEntity {
    const TABLE: &'static str;
    const ID_COLUMN: &'static str;
    const COLUMNS: &'static str;
    /// Whether `(aggregate_type, aggregate_id, version)` is unique.
    const UNIQUE_VERSION: bool;

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error>;

    fn bind_values<'args>(&self, values: &mut Separated<'_, 'args, Postgres, &'static str>);
}

impl PgRecord for StoredEvent {
    const TABLE: &'static str = "domain_events";
    const ID_COLUMN: &'static str = "event_id";
    const COLUMNS: &'static str = "event_id, aggregate_id, aggregate_type, event_type, event_name, \
         event_data, version, correlation_id, causation_id, created_by, occurred_on, created_on, \
         is_deleted, is_active";
    const UNIQUE_VERSION: bool = true;

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            event_id: row.try_get("event_id")?,
            aggregate_id: AggregateId::from(row.try_get::<String, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            event_type: row.try_get("event_type")?,
            event_name: row.try_get("event_name")?,
            event_data: row.try_get("event_data")?,
            version: row.try_get("version")?,
            correlation_id: row.try_get("correlation_id")?,
            causation_id: row.try_get("causation_id")?,
            created_by: row.try_get("created_by")?,
            occurred_on: row.try_get("occurred_on")?,
            created_on: row.try_get("created_on")?,
            is_deleted: row.try_get("is_deleted")?,
            is_active: row.try_get("is_active")?,
        })
    }

    fn bind_values<'args>(&self, values: &mut Separated<'_, 'args, Postgres, &'static str>) {
        values
            .push_bind(self.event_id)
            .push_bind(self.aggregate_id.as_str().to_owned())
            .push_bind(self.aggregate_type.clone())
            .push_bind(self.event_type.clone())
            .push_bind(self.event_name.clone())
            .push_bind(self.event_data.clone())
            .push_bind(self.version)
            .push_bind(self.correlation_id)
            .push_bind(self.causation_id)
            .push_bind(self.created_by.clone())
            .push_bind(self.occurred_on)
            .push_bind(self.created_on)
            .push_bind(self.is_deleted)
            .push_bind(self.is_active);
    }
}

impl PgRecord for StoredNotification {
    const TABLE: &'static str = "notification_events";
    const ID_COLUMN: &'static str = "notification_id";
    const COLUMNS: &'static str = "notification_id, aggregate_id, aggregate_type, \
         notification_type, notification_name, data, caused_by, version, state, attempts, \
         exception, created_on, delivered_on, is_deleted, is_active";
    const UNIQUE_VERSION: bool = false;

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let state: String = row.try_get("state")?;
        let state = NotificationState::parse(&state).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown notification state {state:?}").into())
        })?;
        Ok(Self {
            notification_id: row.try_get("notification_id")?,
            aggregate_id: AggregateId::from(row.try_get::<String, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            notification_type: row.try_get("notification_type")?,
            notification_name: row.try_get("notification_name")?,
            data: row.try_get("data")?,
            caused_by: row.try_get("caused_by")?,
            version: row.try_get("version")?,
            state,
            attempts: row.try_get("attempts")?,
            exception: row.try_get("exception")?,
            created_on: row.try_get("created_on")?,
            delivered_on: row.try_get("delivered_on")?,
            is_deleted: row.try_get("is_deleted")?,
            is_active: row.try_get("is_active")?,
        })
    }

    fn bind_values<'args>(&self, values: &mut Separated<'_, 'args, Postgres, &'static str>) {
        values
            .push_bind(self.notification_id)
            .push_bind(self.aggregate_id.as_str().to_owned())
            .push_bind(self.aggregate_type.clone())
            .push_bind(self.notification_type.clone())
            .push_bind(self.notification_name.clone())
            .push_bind(self.data.clone())
            .push_bind(self.caused_by)
            .push_bind(self.version)
            .push_bind(self.state.as_str())
            .push_bind(self.attempts)
            .push_bind(self.exception.clone())
            .push_bind(self.created_on)
            .push_bind(self.delivered_on)
            .push_bind(self.is_deleted)
            .push_bind(self.is_active);
    }
}

impl PgRecord for StoredSnapshot {
    const TABLE: &'static str = "snapshot_events";
    const ID_COLUMN: &'static str = "snapshot_id";
    const COLUMNS: &'static str = "snapshot_id, aggregate_id, aggregate_type, memento_type, data, \
         version, created_on, is_deleted, is_active";
    const UNIQUE_VERSION: bool = false;

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            snapshot_id: row.try_get("snapshot_id")?,
            aggregate_id: AggregateId::from(row.try_get::<String, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            memento_type: row.try_get("memento_type")?,
            data: row.try_get("data")?,
            version: row.try_get("version")?,
            created_on: row.try_get("created_on")?,
            is_deleted: row.try_get("is_deleted")?,
            is_active: row.try_get("is_active")?,
        })
    }

    fn bind_values<'args>(&self, values: &mut Separated<'_, 'args, Postgres, &'static str>) {
        values
            .push_bind(self.snapshot_id)
            .push_bind(self.aggregate_id.as_str().to_owned())
            .push_bind(self.aggregate_type.clone())
            .push_bind(self.memento_type.clone())
            .push_bind(self.data.clone())
            .push_bind(self.version)
            .push_bind(self.created_on)
            .push_bind(self.is_deleted)
            .push_bind(self.is_active);
    }
}

fn storage_error(err: &sqlx::Error) -> PersistenceError {
    PersistenceError::Storage(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Appends the SQL form of every non-predicate filter.
fn push_filters<T>(builder: &mut QueryBuilder<'_, Postgres>, criteria: &Criteria<T>) {
    builder.push(" WHERE TRUE");
    if let Some(aggregate_id) = &criteria.aggregate_id {
        builder
            .push(" AND aggregate_id = ")
            .push_bind(aggregate_id.as_str().to_owned());
    }
    if let Some(aggregate_type) = &criteria.aggregate_type {
        builder
            .push(" AND aggregate_type = ")
            .push_bind(aggregate_type.clone());
    }
    if let Some(is_deleted) = criteria.is_deleted {
        builder.push(" AND is_deleted = ").push_bind(is_deleted);
    }
    if let Some(is_active) = criteria.is_active {
        builder.push(" AND is_active = ").push_bind(is_active);
    }
    if let Some(version) = criteria.version {
        builder.push(" AND version = ").push_bind(version);
    }
    if let Some(version) = criteria.after_version {
        builder.push(" AND version > ").push_bind(version);
    }
    if let Some(version) = criteria.max_version {
        builder.push(" AND version <= ").push_bind(version);
    }
}

/// Connection state shared by the three stores of one unit of work.
struct PgSession {
    pool: PgPool,
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl fmt::Debug for PgSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgSession")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl PgSession {
    async fn fetch_rows(&self, builder: &mut QueryBuilder<'_, Postgres>) -> Result<Vec<PgRow>, sqlx::Error> {
        let mut guard = self.tx.lock().await;
        let query = builder.build();
        match guard.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await,
            None => query.fetch_all(&self.pool).await,
        }
    }

    async fn execute(&self, builder: &mut QueryBuilder<'_, Postgres>) -> Result<PgQueryResult, sqlx::Error> {
        let mut guard = self.tx.lock().await;
        let tx = match guard.take() {
            Some(tx) => guard.insert(tx),
            None => guard.insert(self.pool.begin().await?),
        };
        builder.build().execute(&mut **tx).await
    }
}

/// One PostgreSQL-backed log.
#[derive(Debug)]
struct PgStore<T> {
    session: Arc<PgSession>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: PgRecord> PgStore<T> {
    fn new(session: Arc<PgSession>) -> Self {
        Self {
            session,
            _entity: PhantomData,
        }
    }

    fn select(criteria: &Criteria<T>, paged: bool) -> QueryBuilder<'static, Postgres> {
        let mut builder =
            QueryBuilder::new(format!("SELECT {} FROM {}", T::COLUMNS, T::TABLE));
        push_filters(&mut builder, criteria);
        if criteria.order_by_version {
            builder.push(" ORDER BY version ASC, seq ASC");
        } else {
            builder.push(" ORDER BY created_on ASC, seq ASC");
        }
        if paged {
            let (skip, take) = criteria.limit_bounds();
            if let Some(take) = take {
                builder.push(" LIMIT ").push_bind(to_i64(take));
            }
            if skip > 0 {
                builder.push(" OFFSET ").push_bind(to_i64(skip));
            }
        }
        builder
    }

    async fn load(&self, mut builder: QueryBuilder<'_, Postgres>) -> Result<Vec<T>, PersistenceError> {
        let rows = self
            .session
            .fetch_rows(&mut builder)
            .await
            .map_err(|e| storage_error(&e))?;
        rows.iter()
            .map(T::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| storage_error(&e))
    }

    /// Rows matching every filter, predicate included, in log order.
    async fn matching(&self, criteria: &Criteria<T>) -> Result<Vec<T>, PersistenceError> {
        let rows = self.load(Self::select(criteria, false)).await?;
        Ok(rows.into_iter().filter(|row| criteria.matches(row)).collect())
    }
}

#[async_trait]
impl<T: PgRecord> EntityStore<T> for PgStore<T> {
    async fn insert(&self, entity: T, cancel: &CancellationToken) -> Result<(), PersistenceError> {
        cancellable(cancel, async {
            let mut builder = QueryBuilder::new(format!(
                "INSERT INTO {} ({}) VALUES (",
                T::TABLE,
                T::COLUMNS
            ));
            {
                let mut values = builder.separated(", ");
                entity.bind_values(&mut values);
            }
            builder.push(")");
            self.session.execute(&mut builder).await.map_err(|e| {
                if T::UNIQUE_VERSION && is_unique_violation(&e) {
                    PersistenceError::ConcurrencyConflict {
                        aggregate_id: entity.aggregate_id().clone(),
                        version: entity.version(),
                    }
                } else {
                    storage_error(&e)
                }
            })?;
            debug!(table = T::TABLE, id = %entity.id(), aggregate_id = %entity.aggregate_id(), "inserted row");
            Ok(())
        })
        .await
    }

    async fn fetch_all(
        &self,
        criteria: &Criteria<T>,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>, PersistenceError> {
        cancellable(cancel, async {
            if criteria.has_predicate() {
                let rows = self.load(Self::select(criteria, false)).await?;
                Ok(criteria.apply(rows))
            } else {
                self.load(Self::select(criteria, true)).await
            }
        })
        .await
    }

    async fn count(
        &self,
        criteria: &Criteria<T>,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError> {
        cancellable(cancel, async {
            if criteria.has_predicate() {
                return Ok(self.matching(criteria).await?.len() as u64);
            }
            let mut builder = QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", T::TABLE));
            push_filters(&mut builder, criteria);
            let rows = self
                .session
                .fetch_rows(&mut builder)
                .await
                .map_err(|e| storage_error(&e))?;
            let count: i64 = match rows.first() {
                Some(row) => row.try_get(0).map_err(|e| storage_error(&e))?,
                None => 0,
            };
            Ok(u64::try_from(count).unwrap_or_default())
        })
        .await
    }

    async fn delete(
        &self,
        criteria: &Criteria<T>,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError> {
        cancellable(cancel, async {
            let mut builder = QueryBuilder::new(format!("DELETE FROM {}", T::TABLE));
            if criteria.has_predicate() {
                let ids: Vec<_> = self
                    .matching(criteria)
                    .await?
                    .iter()
                    .map(T::id)
                    .collect();
                if ids.is_empty() {
                    return Ok(0);
                }
                builder
                    .push(format!(" WHERE {} = ANY(", T::ID_COLUMN))
                    .push_bind(ids)
                    .push(")");
            } else {
                push_filters(&mut builder, criteria);
            }
            let result = self
                .session
                .execute(&mut builder)
                .await
                .map_err(|e| storage_error(&e))?;
            debug!(table = T::TABLE, removed = result.rows_affected(), "deleted rows");
            Ok(result.rows_affected())
        })
        .await
    }

    async fn update(&self, entity: T, cancel: &CancellationToken) -> Result<(), PersistenceError> {
        cancellable(cancel, async {
            let mut builder = QueryBuilder::new(format!(
                "UPDATE {} SET ({}) = (",
                T::TABLE,
                T::COLUMNS
            ));
            {
                let mut values = builder.separated(", ");
                entity.bind_values(&mut values);
            }
            builder
                .push(format!(") WHERE {} = ", T::ID_COLUMN))
                .push_bind(entity.id());
            let result = self
                .session
                .execute(&mut builder)
                .await
                .map_err(|e| storage_error(&e))?;
            if result.rows_affected() == 0 {
                return Err(PersistenceError::Storage(format!(
                    "no row with id {} in {}",
                    entity.id(),
                    T::TABLE
                )));
            }
            Ok(())
        })
        .await
    }
}

/// Connection pool that begins PostgreSQL units of work.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Wraps `pool`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl UnitOfWorkFactory for PgDatabase {
    fn begin(&self) -> Box<dyn UnitOfWork> {
        Box::new(PgUnitOfWork::new(self.pool.clone()))
    }
}

/// PostgreSQL-backed unit of work.
#[derive(Debug)]
pub struct PgUnitOfWork {
    session: Arc<PgSession>,
    events: PgStore<StoredEvent>,
    notifications: PgStore<StoredNotification>,
    snapshots: PgStore<StoredSnapshot>,
}

impl PgUnitOfWork {
    /// Creates a new `PgUnitOfWork` on `pool`. No connection is taken until
    /// the first query.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        let session = Arc::new(PgSession {
            pool,
            tx: Mutex::new(None),
        });
        Self {
            events: PgStore::new(Arc::clone(&session)),
            notifications: PgStore::new(Arc::clone(&session)),
            snapshots: PgStore::new(Arc::clone(&session)),
            session,
        }
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
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
        cancellable(cancel, async {
            let mut guard = self.session.tx.lock().await;
            match guard.take() {
                Some(tx) => {
                    tx.commit()
                        .await
                        .map_err(|e| PersistenceError::Commit(e.to_string()))?;
                    info!("unit of work committed");
                    Ok(())
                }
                None => Ok(()),
            }
        })
        .await
    }

    async fn rollback(&self) -> Result<(), PersistenceError> {
        let mut guard = self.session.tx.lock().await;
        if let Some(tx) = guard.take() {
            tx.rollback().await.map_err(|e| storage_error(&e))?;
            debug!("unit of work rolled back");
        }
        Ok(())
    }
}
