//! Dispatcher configuration.

use std::time::Duration;

/// What to do with a notification whose delivery failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Leave the row pending and try again next cycle, forever.
    #[default]
    Unlimited,
    /// Record each failure and park the row after this many attempts.
    MaxAttempts(u32),
}

impl RetryPolicy {
    /// Returns `true` when a row that has now failed `attempts` times must be parked.
    #[must_use]
    pub fn exhausted(self, attempts: u32) -> bool {
        match self {
            Self::Unlimited => false,
            Self::MaxAttempts(max) => attempts >= max,
        }
    }
}

/// Tuning for the outbox dispatcher loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Maximum pending rows fetched per cycle.
    pub batch_size: usize,
    /// Sleep between cycles.
    pub poll_interval: Duration,
    /// Handling of failed deliveries.
    pub retry_policy: RetryPolicy,
}

impl DispatcherConfig {
    /// Default rows per cycle.
    pub const DEFAULT_BATCH_SIZE: usize = 50;
    /// Default sleep between cycles.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::DEFAULT_BATCH_SIZE,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            retry_policy: RetryPolicy::default(),
        }
    }
}
