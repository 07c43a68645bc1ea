//! Aggregate roots for the Accounts context.

use chronicle_core::aggregate::{AggregateRoot, NotificationOutbox, Originator};
use chronicle_core::clock::Clock;
use chronicle_core::error::PersistenceError;
use chronicle_core::event::{EventMetadata, NotificationMetadata};
use chronicle_core::id::AggregateId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{
    AccountClosed, AccountEvent, AccountEventKind, AccountOpened, FundsDeposited, FundsWithdrawn,
};
use super::notifications::{
    AccountNotification, AccountNotificationKind, LowBalanceWarning, StatementRequested,
};

/// Who did it and why, stamped on every event an operation produces.
#[derive(Clone, Copy)]
pub struct Provenance<'a> {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Principal issuing the command.
    pub issued_by: &'a str,
    /// Time source.
    pub clock: &'a dyn Clock,
}

/// Captured state of an [`Account`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMemento {
    /// Account holder's name.
    pub owner: String,
    /// Address for statements and warnings.
    pub email: String,
    /// Current balance in minor units.
    pub balance: i64,
    /// Warning threshold.
    pub low_balance_threshold: i64,
    /// Whether the account still accepts transactions.
    pub is_open: bool,
}

/// The aggregate root for a customer account.
#[derive(Debug)]
pub struct Account {
    /// Aggregate identifier.
    pub id: AggregateId,
    pub(crate) version: i64,
    pub(crate) owner: String,
    pub(crate) email: String,
    pub(crate) balance: i64,
    pub(crate) low_balance_threshold: i64,
    pub(crate) is_open: bool,
    uncommitted_events: Vec<AccountEvent>,
    uncommitted_notifications: Vec<AccountNotification>,
}

impl Account {
    /// Creates an empty account shell.
    #[must_use]
    pub fn new(id: AggregateId) -> Self {
        Self {
            id,
            version: 0,
            owner: String::new(),
            email: String::new(),
            balance: 0,
            low_balance_threshold: 0,
            is_open: false,
            uncommitted_events: Vec::new(),
            uncommitted_notifications: Vec::new(),
        }
    }

    /// Factory function used when rebuilding accounts from storage.
    #[must_use]
    pub fn shell(id: &AggregateId) -> Self {
        Self::new(id.clone())
    }

    /// Current balance in minor units.
    #[must_use]
    pub fn balance(&self) -> i64 {
        self.balance
    }

    /// Whether the account accepts transactions.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Opens the account.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::Validation` if the account already exists.
    pub fn open(
        &mut self,
        owner: &str,
        email: &str,
        low_balance_threshold: i64,
        provenance: &Provenance<'_>,
    ) -> Result<(), PersistenceError> {
        if self.version > 0 {
            return Err(PersistenceError::Validation(format!(
                "account {} already exists",
                self.id
            )));
        }
        self.record(
            AccountEventKind::AccountOpened(AccountOpened {
                owner: owner.to_owned(),
                email: email.to_owned(),
                low_balance_threshold,
            }),
            provenance,
        );
        Ok(())
    }

    /// Pays `amount` in.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::Validation` for a non-positive amount, a
    /// closed account, or a deposit the balance cannot hold.
    pub fn deposit(&mut self, amount: i64, provenance: &Provenance<'_>) -> Result<(), PersistenceError> {
        self.ensure_open()?;
        ensure_positive(amount)?;
        if self.balance.checked_add(amount).is_none() {
            return Err(PersistenceError::Validation(format!(
                "deposit of {amount} would overflow balance {}",
                self.balance
            )));
        }
        self.record(
            AccountEventKind::FundsDeposited(FundsDeposited { amount }),
            provenance,
        );
        Ok(())
    }

    /// Takes `amount` out. Raises a low-balance warning when the balance
    /// drops below the threshold.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::Validation` for a non-positive amount,
    /// insufficient funds or a closed account.
    pub fn withdraw(&mut self, amount: i64, provenance: &Provenance<'_>) -> Result<(), PersistenceError> {
        self.ensure_open()?;
        ensure_positive(amount)?;
        if amount > self.balance {
            return Err(PersistenceError::Validation(format!(
                "insufficient funds: balance {}, requested {amount}",
                self.balance
            )));
        }

        let was_above = self.balance >= self.low_balance_threshold;
        self.record(
            AccountEventKind::FundsWithdrawn(FundsWithdrawn { amount }),
            provenance,
        );
        if was_above && self.balance < self.low_balance_threshold {
            self.raise(
                AccountNotificationKind::LowBalanceWarning(LowBalanceWarning {
                    email: self.email.clone(),
                    balance: self.balance,
                    threshold: self.low_balance_threshold,
                }),
                provenance.clock,
            );
        }
        Ok(())
    }

    /// Closes the account. The balance must be zero.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::Validation` if the account is already
    /// closed or still holds money.
    pub fn close(&mut self, reason: &str, provenance: &Provenance<'_>) -> Result<(), PersistenceError> {
        self.ensure_open()?;
        if self.balance != 0 {
            return Err(PersistenceError::Validation(format!(
                "cannot close account with balance {}",
                self.balance
            )));
        }
        self.record(
            AccountEventKind::AccountClosed(AccountClosed {
                reason: reason.to_owned(),
            }),
            provenance,
        );
        Ok(())
    }

    /// Queues a statement e-mail. No event is recorded.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::Validation` if the account was never opened.
    pub fn request_statement(&mut self, clock: &dyn Clock) -> Result<(), PersistenceError> {
        if self.version == 0 {
            return Err(PersistenceError::Validation(format!(
                "account {} has not been opened",
                self.id
            )));
        }
        self.raise(
            AccountNotificationKind::StatementRequested(StatementRequested {
                email: self.email.clone(),
                balance: self.balance,
            }),
            clock,
        );
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), PersistenceError> {
        if self.is_open {
            Ok(())
        } else {
            Err(PersistenceError::Validation(format!(
                "account {} is not open",
                self.id
            )))
        }
    }

    fn record(&mut self, kind: AccountEventKind, provenance: &Provenance<'_>) {
        let event = AccountEvent {
            metadata: EventMetadata {
                event_id: Uuid::new_v4(),
                aggregate_id: self.id.clone(),
                version: self.version + 1,
                correlation_id: provenance.correlation_id,
                causation_id: provenance.correlation_id,
                created_by: provenance.issued_by.to_owned(),
                occurred_on: provenance.clock.now(),
            },
            kind,
        };
        self.apply(&event);
        self.uncommitted_events.push(event);
    }

    fn raise(&mut self, kind: AccountNotificationKind, clock: &dyn Clock) {
        let caused_by = self
            .uncommitted_events
            .last()
            .map(|event| event.metadata.event_id);
        self.uncommitted_notifications.push(AccountNotification {
            metadata: NotificationMetadata {
                notification_id: Uuid::new_v4(),
                aggregate_id: self.id.clone(),
                caused_by,
                version: self.version,
                raised_on: clock.now(),
            },
            kind,
        });
    }
}

fn ensure_positive(amount: i64) -> Result<(), PersistenceError> {
    if amount > 0 {
        Ok(())
    } else {
        Err(PersistenceError::Validation(format!(
            "amount must be positive, got {amount}"
        )))
    }
}

impl AggregateRoot for Account {
    type Event = AccountEvent;

    const AGGREGATE_TYPE: &'static str = "account";

    fn aggregate_id(&self) -> &AggregateId {
        &self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &Self::Event) {
        match &event.kind {
            AccountEventKind::AccountOpened(payload) => {
                self.owner.clone_from(&payload.owner);
                self.email.clone_from(&payload.email);
                self.low_balance_threshold = payload.low_balance_threshold;
                self.is_open = true;
            }
            // Replay saturates on an out-of-range stream.
            AccountEventKind::FundsDeposited(payload) => {
                self.balance = self.balance.saturating_add(payload.amount);
            }
            AccountEventKind::FundsWithdrawn(payload) => {
                self.balance = self.balance.saturating_sub(payload.amount);
            }
            AccountEventKind::AccountClosed(_) => self.is_open = false,
        }
        self.version = event.metadata.version;
    }

    fn uncommitted_events(&self) -> &[Self::Event] {
        &self.uncommitted_events
    }

    fn clear_uncommitted_events(&mut self) {
        self.uncommitted_events.clear();
    }
}

impl NotificationOutbox for Account {
    type Notification = AccountNotification;

    fn uncommitted_notifications(&self) -> &[Self::Notification] {
        &self.uncommitted_notifications
    }

    fn clear_uncommitted_notifications(&mut self) {
        self.uncommitted_notifications.clear();
    }
}

impl Originator for Account {
    type Memento = AccountMemento;

    const MEMENTO_TYPE: &'static str = "account.memento";

    fn create_memento(&self) -> AccountMemento {
        AccountMemento {
            owner: self.owner.clone(),
            email: self.email.clone(),
            balance: self.balance,
            low_balance_threshold: self.low_balance_threshold,
            is_open: self.is_open,
        }
    }

    fn set_memento(&mut self, memento: AccountMemento, version: i64) {
        self.owner = memento.owner;
        self.email = memento.email;
        self.balance = memento.balance;
        self.low_balance_threshold = memento.low_balance_threshold;
        self.is_open = memento.is_open;
        self.version = version;
    }
}
