//! Aggregate factories that misbehave on purpose.

use std::marker::PhantomData;

use chronicle_core::aggregate::AggregateFactory;
use chronicle_core::error::PersistenceError;
use chronicle_core::id::AggregateId;

/// A factory that can never build the aggregate shell.
#[derive(Debug)]
pub struct FailingFactory<A> {
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> Default for FailingFactory<A> {
    fn default() -> Self {
        Self {
            _aggregate: PhantomData,
        }
    }
}

impl<A> AggregateFactory<A> for FailingFactory<A> {
    fn create(&self, aggregate_id: &AggregateId) -> Result<A, PersistenceError> {
        Err(PersistenceError::InstanceCreation(format!(
            "no constructor available for {aggregate_id}"
        )))
    }
}
