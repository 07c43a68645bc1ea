//! Command handlers for the Accounts context.
//!
//! Each handler validates the command, loads the account, runs the domain
//! operation and hands the aggregate to the persistence service. Handlers
//! that load an account append against the version they loaded, so a write
//! based on a stale read fails with `ConcurrencyConflict`.

use std::sync::Arc;

use chronicle_core::aggregate::AggregateRoot;
use chronicle_core::clock::Clock;
use chronicle_core::error::PersistenceError;
use chronicle_core::id::AggregateId;
use chronicle_core::store::UnitOfWorkFactory;
use chronicle_persistence::{AggregatePersistenceService, Appended, EventPublisher};
use tokio_util::sync::CancellationToken;

use crate::domain::aggregates::{Account, Provenance};
use crate::domain::commands::{
    CloseAccount, DepositFunds, OpenAccount, RequestStatement, SnapshotAccount, WithdrawFunds,
};
use crate::domain::events::AccountEvent;

/// Persistence service for accounts.
pub type AccountService = AggregatePersistenceService<Account>;

/// Builds the account service over `database`.
#[must_use]
pub fn account_service(
    database: Arc<dyn UnitOfWorkFactory>,
    publisher: Arc<dyn EventPublisher<AccountEvent>>,
    clock: Arc<dyn Clock>,
) -> AccountService {
    AggregatePersistenceService::new(database, publisher, Arc::new(Account::shell))
        .with_clock(clock)
}

/// Loads an account from its latest snapshot plus newer events.
///
/// # Errors
///
/// Returns `PersistenceError::AggregateNotFound` if the account has no history.
pub(crate) async fn load_account(
    account_id: &AggregateId,
    service: &AccountService,
    cancel: &CancellationToken,
) -> Result<Account, PersistenceError> {
    service
        .load(account_id, cancel)
        .await?
        .ok_or_else(|| PersistenceError::AggregateNotFound(account_id.clone()))
}

/// Handles the `OpenAccount` command. Returns the new account's id.
///
/// # Errors
///
/// Returns `PersistenceError::Validation` for a blank owner or malformed
/// e-mail address, otherwise any persistence error.
pub async fn handle_open_account(
    command: &OpenAccount,
    clock: &dyn Clock,
    service: &AccountService,
    cancel: &CancellationToken,
) -> Result<AggregateId, PersistenceError> {
    if command.owner.trim().is_empty() {
        return Err(PersistenceError::Validation("owner must not be empty".into()));
    }
    if !command.email.contains('@') {
        return Err(PersistenceError::Validation(format!(
            "invalid e-mail address: {}",
            command.email
        )));
    }

    let account_id = AggregateId::generate();
    let mut account = Account::new(account_id.clone());
    account.open(
        command.owner.trim(),
        &command.email,
        command.low_balance_threshold,
        &Provenance {
            correlation_id: command.correlation_id,
            issued_by: &command.issued_by,
            clock,
        },
    )?;
    service.append_with_outbox(&mut account, cancel).await?;
    Ok(account_id)
}

/// Handles the `DepositFunds` command.
///
/// The write is rejected if another writer appended to the account after
/// it was loaded.
///
/// # Errors
///
/// Returns `AggregateNotFound`, `Validation`, `ConcurrencyConflict` or any
/// persistence error.
pub async fn handle_deposit_funds(
    command: &DepositFunds,
    clock: &dyn Clock,
    service: &AccountService,
    cancel: &CancellationToken,
) -> Result<Appended, PersistenceError> {
    let mut account = load_account(&command.account_id, service, cancel).await?;
    let loaded_version = account.version();

    account.deposit(
        command.amount,
        &Provenance {
            correlation_id: command.correlation_id,
            issued_by: &command.issued_by,
            clock,
        },
    )?;
    service
        .append_expecting(&mut account, loaded_version, cancel)
        .await
}

/// Handles the `WithdrawFunds` command. A low-balance warning, if raised,
/// is queued in the same commit as the withdrawal.
///
/// The write is rejected if another writer appended to the account after
/// it was loaded.
///
/// # Errors
///
/// Returns `AggregateNotFound`, `Validation`, `ConcurrencyConflict` or any
/// persistence error.
pub async fn handle_withdraw_funds(
    command: &WithdrawFunds,
    clock: &dyn Clock,
    service: &AccountService,
    cancel: &CancellationToken,
) -> Result<Appended, PersistenceError> {
    let mut account = load_account(&command.account_id, service, cancel).await?;
    let loaded_version = account.version();

    account.withdraw(
        command.amount,
        &Provenance {
            correlation_id: command.correlation_id,
            issued_by: &command.issued_by,
            clock,
        },
    )?;
    service
        .append_with_outbox_expecting(&mut account, loaded_version, cancel)
        .await
}

/// Handles the `CloseAccount` command.
///
/// # Errors
///
/// Returns `AggregateNotFound`, `Validation`, `ConcurrencyConflict` or any
/// persistence error.
pub async fn handle_close_account(
    command: &CloseAccount,
    clock: &dyn Clock,
    service: &AccountService,
    cancel: &CancellationToken,
) -> Result<Appended, PersistenceError> {
    let mut account = load_account(&command.account_id, service, cancel).await?;
    let loaded_version = account.version();

    account.close(
        &command.reason,
        &Provenance {
            correlation_id: command.correlation_id,
            issued_by: &command.issued_by,
            clock,
        },
    )?;
    service
        .append_expecting(&mut account, loaded_version, cancel)
        .await
}

/// Handles the `RequestStatement` command by queueing a statement e-mail.
///
/// # Errors
///
/// Returns `AggregateNotFound`, `ConcurrencyConflict` when the balance moved
/// while the statement was being built, or any persistence error.
pub async fn handle_request_statement(
    command: &RequestStatement,
    clock: &dyn Clock,
    service: &AccountService,
    cancel: &CancellationToken,
) -> Result<Appended, PersistenceError> {
    let mut account = load_account(&command.account_id, service, cancel).await?;
    let loaded_version = account.version();
    account.request_statement(clock)?;
    service
        .append_with_outbox_expecting(&mut account, loaded_version, cancel)
        .await
}

/// Handles the `SnapshotAccount` command. Returns the snapshotted version.
///
/// # Errors
///
/// Returns `AggregateNotFound` or any persistence error.
pub async fn handle_snapshot_account(
    command: &SnapshotAccount,
    service: &AccountService,
    cancel: &CancellationToken,
) -> Result<i64, PersistenceError> {
    let account = load_account(&command.account_id, service, cancel).await?;
    service.append_as_snapshot(&account, cancel).await?;
    Ok(account.version())
}
