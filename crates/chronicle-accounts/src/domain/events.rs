//! Domain events for the Accounts context.

use chronicle_core::event::{DomainEvent, EventMetadata};
use serde::{Deserialize, Serialize};

/// Emitted when an account is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOpened {
    /// Account holder's name.
    pub owner: String,
    /// Address that receives statements and warnings.
    pub email: String,
    /// Balance below which a warning is sent.
    pub low_balance_threshold: i64,
}

/// Emitted when money is paid in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsDeposited {
    /// Amount in minor units.
    pub amount: i64,
}

/// Emitted when money is taken out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsWithdrawn {
    /// Amount in minor units.
    pub amount: i64,
}

/// Emitted when an account is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountClosed {
    /// Why the account was closed.
    pub reason: String,
}

/// Event payload variants for the Accounts context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountEventKind {
    /// An account has been opened.
    AccountOpened(AccountOpened),
    /// Funds have been deposited.
    FundsDeposited(FundsDeposited),
    /// Funds have been withdrawn.
    FundsWithdrawn(FundsWithdrawn),
    /// The account has been closed.
    AccountClosed(AccountClosed),
}

/// Domain event envelope for the Accounts context.
#[derive(Debug, Clone)]
pub struct AccountEvent {
    /// Event metadata.
    pub metadata: EventMetadata,
    /// Event-specific payload.
    pub kind: AccountEventKind,
}

impl AccountEvent {
    /// Tag of [`AccountOpened`].
    pub const ACCOUNT_OPENED: &'static str = "account.account_opened";
    /// Tag of [`FundsDeposited`].
    pub const FUNDS_DEPOSITED: &'static str = "account.funds_deposited";
    /// Tag of [`FundsWithdrawn`].
    pub const FUNDS_WITHDRAWN: &'static str = "account.funds_withdrawn";
    /// Tag of [`AccountClosed`].
    pub const ACCOUNT_CLOSED: &'static str = "account.account_closed";
}

impl DomainEvent for AccountEvent {
    type Payload = AccountEventKind;

    fn event_type(&self) -> &'static str {
        match &self.kind {
            AccountEventKind::AccountOpened(_) => Self::ACCOUNT_OPENED,
            AccountEventKind::FundsDeposited(_) => Self::FUNDS_DEPOSITED,
            AccountEventKind::FundsWithdrawn(_) => Self::FUNDS_WITHDRAWN,
            AccountEventKind::AccountClosed(_) => Self::ACCOUNT_CLOSED,
        }
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    fn payload(&self) -> &AccountEventKind {
        &self.kind
    }

    fn from_parts(metadata: EventMetadata, kind: AccountEventKind) -> Self {
        Self { metadata, kind }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use chronicle_core::id::AggregateId;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_event_name_is_the_short_form_of_the_tag() {
        let event = AccountEvent {
            metadata: EventMetadata {
                event_id: Uuid::new_v4(),
                aggregate_id: AggregateId::from("acc-1"),
                version: 1,
                correlation_id: Uuid::new_v4(),
                causation_id: Uuid::new_v4(),
                created_by: "teller".to_owned(),
                occurred_on: Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
            },
            kind: AccountEventKind::FundsDeposited(FundsDeposited { amount: 500 }),
        };

        assert_eq!(event.event_type(), "account.funds_deposited");
        assert_eq!(event.event_name(), "funds_deposited");
    }
}
