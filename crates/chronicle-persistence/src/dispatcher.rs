//! Outbox dispatcher.
//!
//! Drains pending notifications on a fixed schedule: begin a unit of work,
//! fetch a batch, try each row, mark the delivered ones, commit once, sleep,
//! repeat.
//! Delivery is at-least-once. A crash between sending and committing sends
//! the row again on the next cycle.

use std::sync::Arc;

use async_trait::async_trait;
use chronicle_core::clock::{Clock, SystemClock};
use chronicle_core::criteria::Criteria;
use chronicle_core::entity::{NotificationState, StoredNotification};
use chronicle_core::error::PersistenceError;
use chronicle_core::store::{UnitOfWork, UnitOfWorkFactory};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DispatcherConfig, RetryPolicy};

/// Delivers one outbox notification to the outside world.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Sends `notification`.
    ///
    /// # Errors
    ///
    /// Any error leaves the row pending for a later cycle.
    async fn send(&self, notification: &StoredNotification) -> Result<(), PersistenceError>;
}

/// Outcome of one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Pending rows fetched.
    pub fetched: usize,
    /// Rows sent and marked delivered.
    pub delivered: usize,
    /// Rows whose delivery failed this cycle.
    pub failed: usize,
    /// Failed rows that ran out of attempts and were parked.
    pub parked: usize,
}

/// Background worker that empties the notification outbox.
pub struct NotificationDispatcher {
    database: Arc<dyn UnitOfWorkFactory>,
    sender: Arc<dyn NotificationSender>,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NotificationDispatcher {
    /// Creates a dispatcher stamping delivery times with the system clock.
    #[must_use]
    pub fn new(
        database: Arc<dyn UnitOfWorkFactory>,
        sender: Arc<dyn NotificationSender>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            database,
            sender,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock that stamps `delivered_on`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Runs one cycle.
    ///
    /// Rows are sent one by one, oldest first. A failed send is logged and
    /// counted; it never stops the batch. Each cycle begins its own unit of
    /// work and commits it once, and only when some row changed.
    ///
    /// # Errors
    ///
    /// Returns a storage or commit error. The unit of work is rolled back,
    /// so every row of the batch stays pending.
    pub async fn dispatch_batch(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, PersistenceError> {
        let unit_of_work = self.database.begin();
        let outcome = self.deliver_pending(unit_of_work.as_ref(), cancel).await;
        match outcome {
            Ok(report) => Ok(report),
            Err(error) => {
                if let Err(rollback_error) = unit_of_work.rollback().await {
                    warn!(error = %rollback_error, "rollback failed");
                }
                Err(error)
            }
        }
    }

    async fn deliver_pending(
        &self,
        unit_of_work: &dyn UnitOfWork,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, PersistenceError> {
        let pending = Criteria::all().live().take(self.config.batch_size);
        let rows = unit_of_work
            .notifications()
            .fetch_all(&pending, cancel)
            .await?;

        let mut report = DispatchReport {
            fetched: rows.len(),
            ..DispatchReport::default()
        };
        let mut changed = 0_usize;

        for mut row in rows {
            match self.sender.send(&row).await {
                Ok(()) => {
                    row.attempts = row.attempts.saturating_add(1);
                    row.state = NotificationState::Delivered;
                    row.delivered_on = Some(self.clock.now());
                    row.exception = None;
                    row.is_deleted = true;
                    debug!(notification_id = %row.notification_id, "notification delivered");
                    unit_of_work.notifications().update(row, cancel).await?;
                    report.delivered += 1;
                    changed += 1;
                }
                Err(error) => {
                    warn!(
                        notification_id = %row.notification_id,
                        notification_type = %row.notification_type,
                        error = %error,
                        "notification delivery failed"
                    );
                    report.failed += 1;
                    if let RetryPolicy::MaxAttempts(_) = self.config.retry_policy {
                        if self.record_failure(&mut row, &error) {
                            report.parked += 1;
                        }
                        unit_of_work.notifications().update(row, cancel).await?;
                        changed += 1;
                    }
                }
            }
        }

        if changed > 0 {
            unit_of_work.commit(cancel).await?;
        }
        Ok(report)
    }

    /// Records a failed attempt. Returns `true` when the row got parked.
    fn record_failure(&self, row: &mut StoredNotification, error: &PersistenceError) -> bool {
        row.attempts = row.attempts.saturating_add(1);
        row.exception = Some(error.to_string());
        let attempts = u32::try_from(row.attempts).unwrap_or(0);
        if self.config.retry_policy.exhausted(attempts) {
            warn!(
                notification_id = %row.notification_id,
                attempts,
                "notification parked after repeated failures"
            );
            row.state = NotificationState::Failed;
            row.is_active = false;
            true
        } else {
            false
        }
    }

    /// Loops until `cancel` fires.
    ///
    /// Cancellation is observed before each cycle and during the sleep. A
    /// cycle in progress always runs to completion, commit included.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "notification dispatcher started"
        );
        let in_flight = CancellationToken::new();

        while !cancel.is_cancelled() {
            match self.dispatch_batch(&in_flight).await {
                Ok(report) if report.fetched > 0 => info!(
                    fetched = report.fetched,
                    delivered = report.delivered,
                    failed = report.failed,
                    parked = report.parked,
                    "dispatch cycle finished"
                ),
                Ok(_) => debug!("outbox empty"),
                Err(error) => error!(error = %error, "dispatch cycle failed"),
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("notification dispatcher stopped");
    }
}
