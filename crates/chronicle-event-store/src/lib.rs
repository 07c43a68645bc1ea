//! Chronicle storage adapters.
//!
//! `PgDatabase` persists the three logs in PostgreSQL, one transaction per
//! unit of work it begins. `InMemoryDatabase` keeps them in process with the
//! same staged/committed visibility rules.

pub mod memory;
pub mod pg_unit_of_work;
pub mod schema;

pub use memory::{InMemoryDatabase, InMemoryUnitOfWork};
pub use pg_unit_of_work::{PgDatabase, PgUnitOfWork};
