//! Chronicle Core: shared persistence abstractions.
//!
//! This crate defines the capability traits aggregates implement, the
//! persisted entity shapes, query criteria, and the store and unit-of-work
//! contracts that storage adapters fulfil. It contains no infrastructure code.

pub mod aggregate;
pub mod clock;
pub mod codec;
pub mod criteria;
pub mod entity;
pub mod error;
pub mod event;
pub mod id;
pub mod store;
