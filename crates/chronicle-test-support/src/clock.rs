//! Deterministic `Clock` implementations for tests.

use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};
use chronicle_core::clock::Clock;

/// A clock that always returns a fixed point in time.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    /// Noon, 15 January 2026.
    ///
    /// # Panics
    ///
    /// Never in practice; the date is a valid literal.
    #[must_use]
    pub fn noon() -> Self {
        Self(Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A clock that advances by `step` after every reading.
#[derive(Debug)]
pub struct SteppingClock {
    next: Mutex<DateTime<Utc>>,
    step: Duration,
}

impl SteppingClock {
    /// Starts at `start` and advances one second per reading.
    #[must_use]
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self::new(start, Duration::seconds(1))
    }

    /// Starts at `start` and advances by `step` per reading.
    #[must_use]
    pub fn new(start: DateTime<Utc>, step: Duration) -> Self {
        Self {
            next: Mutex::new(start),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let mut next = self.next.lock().unwrap();
        let current = *next;
        *next = current + self.step;
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stepping_clock_advances_per_reading() {
        let start = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let clock = SteppingClock::starting_at(start);

        let first = clock.now();
        let second = clock.now();

        assert_eq!(first, start);
        assert_eq!(second - first, Duration::seconds(1));
    }
}
