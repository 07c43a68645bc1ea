//! Query handlers for the Accounts context.
//!
//! This module contains query handlers that rebuild accounts or read the
//! event log and return read-only view DTOs.

use chrono::{DateTime, Utc};
use chronicle_core::aggregate::AggregateRoot;
use chronicle_core::criteria::Criteria;
use chronicle_core::entity::StoredEvent;
use chronicle_core::error::PersistenceError;
use chronicle_core::id::AggregateId;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::application::command_handlers::{AccountService, load_account};
use crate::domain::aggregates::Account;

/// Read-only view of an account aggregate.
#[derive(Debug, Serialize)]
pub struct AccountView {
    /// The account identifier.
    pub account_id: AggregateId,
    /// Account holder's name.
    pub owner: String,
    /// Address for statements and warnings.
    pub email: String,
    /// Current balance in minor units.
    pub balance: i64,
    /// Whether the account accepts transactions.
    pub is_open: bool,
    /// Current version (event count).
    pub version: i64,
}

/// One line of an account's history.
#[derive(Debug, Serialize)]
pub struct LedgerEntry {
    /// Version the event produced.
    pub version: i64,
    /// Short event name.
    pub event_name: String,
    /// Principal that caused the event.
    pub created_by: String,
    /// When the event happened.
    pub occurred_on: DateTime<Utc>,
}

/// A page of an account's history.
#[derive(Debug, Serialize)]
pub struct LedgerPage {
    /// Entries on this page, oldest first.
    pub entries: Vec<LedgerEntry>,
    /// Total number of entries across all pages.
    pub total: u64,
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.aggregate_id().clone(),
            owner: account.owner.clone(),
            email: account.email.clone(),
            balance: account.balance,
            is_open: account.is_open,
            version: account.version(),
        }
    }
}

/// Retrieves an account by its aggregate ID.
///
/// # Errors
///
/// Returns `PersistenceError::AggregateNotFound` if no events exist for the ID.
/// Returns `PersistenceError::Codec` if event deserialization fails.
pub async fn get_account_by_id(
    account_id: &AggregateId,
    service: &AccountService,
    cancel: &CancellationToken,
) -> Result<AccountView, PersistenceError> {
    let account = load_account(account_id, service, cancel).await?;
    Ok(AccountView::from(&account))
}

/// Retrieves one page of an account's event history.
///
/// # Errors
///
/// Returns `PersistenceError::AggregateNotFound` if the account has no
/// events, or a storage error.
pub async fn get_account_ledger(
    account_id: &AggregateId,
    size: Option<usize>,
    index: Option<usize>,
    service: &AccountService,
    cancel: &CancellationToken,
) -> Result<LedgerPage, PersistenceError> {
    let history = Criteria::<StoredEvent>::for_aggregate(account_id.clone())
        .of_type(<Account as AggregateRoot>::AGGREGATE_TYPE)
        .live();
    let total = service.count_events(&history, cancel).await?;
    if total == 0 {
        return Err(PersistenceError::AggregateNotFound(account_id.clone()));
    }

    let rows = service
        .read_events(&history.page(size, index), cancel)
        .await?;
    let entries = rows
        .into_iter()
        .map(|row| LedgerEntry {
            version: row.version,
            event_name: row.event_name,
            created_by: row.created_by,
            occurred_on: row.occurred_on,
        })
        .collect();
    Ok(LedgerPage { entries, total })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chronicle_event_store::InMemoryDatabase;
    use chronicle_persistence::NoopPublisher;
    use chronicle_test_support::FixedClock;
    use uuid::Uuid;

    use super::*;
    use crate::application::command_handlers::{
        account_service, handle_deposit_funds, handle_open_account,
    };
    use crate::domain::commands::{DepositFunds, OpenAccount};

    async fn seeded(deposits: &[i64]) -> (AccountService, AggregateId) {
        let clock = FixedClock::noon();
        let cancel = CancellationToken::new();
        let service = account_service(
            Arc::new(InMemoryDatabase::new()),
            Arc::new(NoopPublisher),
            Arc::new(clock),
        );
        let account_id = handle_open_account(
            &OpenAccount {
                correlation_id: Uuid::new_v4(),
                issued_by: "teller-7".to_owned(),
                owner: "Grace Hopper".to_owned(),
                email: "grace@example.com".to_owned(),
                low_balance_threshold: 0,
            },
            &clock,
            &service,
            &cancel,
        )
        .await
        .unwrap();
        for amount in deposits {
            handle_deposit_funds(
                &DepositFunds {
                    correlation_id: Uuid::new_v4(),
                    issued_by: "teller-7".to_owned(),
                    account_id: account_id.clone(),
                    amount: *amount,
                },
                &clock,
                &service,
                &cancel,
            )
            .await
            .unwrap();
        }
        (service, account_id)
    }

    #[tokio::test]
    async fn test_get_account_by_id_returns_view_with_state() {
        // Arrange
        let (service, account_id) = seeded(&[100, 23]).await;

        // Act
        let view = get_account_by_id(&account_id, &service, &CancellationToken::new())
            .await
            .unwrap();

        // Assert
        assert_eq!(view.account_id, account_id);
        assert_eq!(view.owner, "Grace Hopper");
        assert_eq!(view.balance, 123);
        assert!(view.is_open);
        assert_eq!(view.version, 3);
    }

    #[tokio::test]
    async fn test_get_account_by_id_returns_not_found_when_no_events() {
        // Arrange
        let (service, _) = seeded(&[]).await;
        let missing = AggregateId::from("acc-missing");

        // Act
        let result = get_account_by_id(&missing, &service, &CancellationToken::new()).await;

        // Assert
        match result {
            Err(PersistenceError::AggregateNotFound(id)) => assert_eq!(id, missing),
            other => panic!("expected AggregateNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_account_ledger_pages_history() {
        // Arrange
        let (service, account_id) = seeded(&[1, 2, 3, 4]).await;

        // Act
        let page = get_account_ledger(
            &account_id,
            Some(2),
            Some(1),
            &service,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // Assert
        assert_eq!(page.total, 5);
        let versions: Vec<i64> = page.entries.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![3, 4]);
        assert!(page.entries.iter().all(|e| e.event_name == "funds_deposited"));
    }
}
