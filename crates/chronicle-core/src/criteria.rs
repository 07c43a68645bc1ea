//! Query criteria shared by every store.

use std::fmt;
use std::sync::Arc;

use crate::entity::StoreEntity;
use crate::id::AggregateId;

/// Predicate evaluated against a stored entity and its document.
pub type EntityPredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Filter and paging criteria for store queries.
///
/// Absent filters match everything. Results are ordered by `created_on`
/// ascending, or by `version` ascending when [`Criteria::in_version_order`]
/// is set, with ties kept in insertion order.
pub struct Criteria<T> {
    /// Exact aggregate match.
    pub aggregate_id: Option<AggregateId>,
    /// Exact aggregate type match.
    pub aggregate_type: Option<String>,
    /// Required soft-delete flag.
    pub is_deleted: Option<bool>,
    /// Required active flag.
    pub is_active: Option<bool>,
    /// Exact version match.
    pub version: Option<i64>,
    /// Exclusive lower version bound.
    pub after_version: Option<i64>,
    /// Inclusive upper version bound.
    pub max_version: Option<i64>,
    /// In-process predicate over the stored entity.
    pub predicate: Option<EntityPredicate<T>>,
    /// Cap applied after paging.
    pub count: Option<usize>,
    /// Page size.
    pub size: Option<usize>,
    /// Page index (or raw skip when `size` is absent).
    pub index: Option<usize>,
    /// Order by `version` instead of `created_on`.
    pub order_by_version: bool,
}

impl<T> Default for Criteria<T> {
    fn default() -> Self {
        Self {
            aggregate_id: None,
            aggregate_type: None,
            is_deleted: None,
            is_active: None,
            version: None,
            after_version: None,
            max_version: None,
            predicate: None,
            count: None,
            size: None,
            index: None,
            order_by_version: false,
        }
    }
}

impl<T> Clone for Criteria<T> {
    fn clone(&self) -> Self {
        Self {
            aggregate_id: self.aggregate_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            is_deleted: self.is_deleted,
            is_active: self.is_active,
            version: self.version,
            after_version: self.after_version,
            max_version: self.max_version,
            predicate: self.predicate.clone(),
            count: self.count,
            size: self.size,
            index: self.index,
            order_by_version: self.order_by_version,
        }
    }
}

impl<T> fmt::Debug for Criteria<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Criteria")
            .field("aggregate_id", &self.aggregate_id)
            .field("aggregate_type", &self.aggregate_type)
            .field("is_deleted", &self.is_deleted)
            .field("is_active", &self.is_active)
            .field("version", &self.version)
            .field("after_version", &self.after_version)
            .field("max_version", &self.max_version)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .field("count", &self.count)
            .field("size", &self.size)
            .field("index", &self.index)
            .field("order_by_version", &self.order_by_version)
            .finish()
    }
}

impl<T> Criteria<T> {
    /// Matches every row.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches rows of one aggregate.
    #[must_use]
    pub fn for_aggregate(aggregate_id: impl Into<AggregateId>) -> Self {
        Self {
            aggregate_id: Some(aggregate_id.into()),
            ..Self::default()
        }
    }

    /// Restricts to one aggregate type.
    #[must_use]
    pub fn of_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    /// Restricts to active, non-deleted rows.
    #[must_use]
    pub fn live(mut self) -> Self {
        self.is_deleted = Some(false);
        self.is_active = Some(true);
        self
    }

    /// Restricts on the soft-delete flag.
    #[must_use]
    pub fn deleted(mut self, is_deleted: bool) -> Self {
        self.is_deleted = Some(is_deleted);
        self
    }

    /// Restricts on the active flag.
    #[must_use]
    pub fn active(mut self, is_active: bool) -> Self {
        self.is_active = Some(is_active);
        self
    }

    /// Restricts to one exact version.
    #[must_use]
    pub fn at_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    /// Restricts to versions strictly greater than `version`.
    #[must_use]
    pub fn after_version(mut self, version: i64) -> Self {
        self.after_version = Some(version);
        self
    }

    /// Restricts to versions less than or equal to `version`.
    #[must_use]
    pub fn up_to_version(mut self, version: i64) -> Self {
        self.max_version = Some(version);
        self
    }

    /// Adds an in-process predicate.
    #[must_use]
    pub fn matching(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Caps the number of rows returned.
    #[must_use]
    pub fn take(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Sets paging.
    #[must_use]
    pub fn page(mut self, size: Option<usize>, index: Option<usize>) -> Self {
        self.size = size;
        self.index = index;
        self
    }

    /// Orders by `version` ascending instead of `created_on`.
    #[must_use]
    pub fn in_version_order(mut self) -> Self {
        self.order_by_version = true;
        self
    }

    /// Returns `(skip, take)` for the configured paging.
    ///
    /// Index without size skips `index` rows with no cap; size without index
    /// takes `size` rows from the start; both skip `index * size` rows.
    #[must_use]
    pub fn page_bounds(&self) -> (usize, Option<usize>) {
        match (self.size, self.index) {
            (None, None) => (0, None),
            (None, Some(index)) => (index, None),
            (Some(size), None) => (0, Some(size)),
            (Some(size), Some(index)) => (index.saturating_mul(size), Some(size)),
        }
    }

    /// Returns `(skip, take)` with the `count` cap folded in.
    #[must_use]
    pub fn limit_bounds(&self) -> (usize, Option<usize>) {
        let (skip, take) = self.page_bounds();
        let take = match (take, self.count) {
            (Some(take), Some(count)) => Some(take.min(count)),
            (take, None) => take,
            (None, count) => count,
        };
        (skip, take)
    }

    /// Returns `true` when some filter must be evaluated in process.
    #[must_use]
    pub fn has_predicate(&self) -> bool {
        self.predicate.is_some()
    }
}

impl<T: StoreEntity> Criteria<T> {
    /// Returns `true` when `entity` satisfies every present filter.
    pub fn matches(&self, entity: &T) -> bool {
        if let Some(id) = &self.aggregate_id {
            if entity.aggregate_id() != id {
                return false;
            }
        }
        if let Some(aggregate_type) = &self.aggregate_type {
            if entity.aggregate_type() != aggregate_type.as_str() {
                return false;
            }
        }
        if self.is_deleted.is_some_and(|flag| entity.is_deleted() != flag) {
            return false;
        }
        if self.is_active.is_some_and(|flag| entity.is_active() != flag) {
            return false;
        }
        let version = entity.version();
        if self.version.is_some_and(|v| version != v)
            || self.after_version.is_some_and(|v| version <= v)
            || self.max_version.is_some_and(|v| version > v)
        {
            return false;
        }
        self.predicate.as_ref().is_none_or(|predicate| predicate(entity))
    }

    /// Filters, orders and pages rows held in memory.
    ///
    /// The sort is stable, so rows sharing a sort key keep the order they
    /// were given in.
    pub fn apply<I>(&self, rows: I) -> Vec<T>
    where
        I: IntoIterator<Item = T>,
    {
        let mut matched: Vec<T> = rows.into_iter().filter(|row| self.matches(row)).collect();
        if self.order_by_version {
            matched.sort_by_key(T::version);
        } else {
            matched.sort_by_key(T::created_on);
        }
        let (skip, take) = self.limit_bounds();
        let paged = matched.into_iter().skip(skip);
        match take {
            Some(take) => paged.take(take).collect(),
            None => paged.collect(),
        }
    }

    /// Counts matching rows, ignoring paging.
    pub fn count_matches<'a, I>(&self, rows: I) -> usize
    where
        I: IntoIterator<Item = &'a T>,
    {
        rows.into_iter().filter(|row| self.matches(row)).count()
    }
}
