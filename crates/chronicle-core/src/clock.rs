//! Clock abstraction for stamping stored rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Source of `created_on` and delivery timestamps.
///
/// Log order is `created_on` ascending, so tests inject a deterministic clock.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock that delegates to the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}
