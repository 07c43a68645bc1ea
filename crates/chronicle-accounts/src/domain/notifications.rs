//! Outbox notifications for the Accounts context.
//!
//! These are e-mails. They are stored with the events that caused them and
//! delivered later by the dispatcher.

use chronicle_core::event::{NotificationEvent, NotificationMetadata};
use serde::{Deserialize, Serialize};

/// The holder asked for a statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementRequested {
    /// Recipient address.
    pub email: String,
    /// Balance at the time of the request.
    pub balance: i64,
}

/// A withdrawal took the balance below the configured threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowBalanceWarning {
    /// Recipient address.
    pub email: String,
    /// Balance after the withdrawal.
    pub balance: i64,
    /// The threshold that was crossed.
    pub threshold: i64,
}

/// Notification payload variants for the Accounts context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountNotificationKind {
    /// A statement e-mail.
    StatementRequested(StatementRequested),
    /// A low-balance e-mail.
    LowBalanceWarning(LowBalanceWarning),
}

/// Notification envelope for the Accounts context.
#[derive(Debug, Clone)]
pub struct AccountNotification {
    /// Notification metadata.
    pub metadata: NotificationMetadata,
    /// Notification-specific payload.
    pub kind: AccountNotificationKind,
}

impl AccountNotification {
    /// Tag of [`StatementRequested`].
    pub const STATEMENT_REQUESTED: &'static str = "account.statement_requested";
    /// Tag of [`LowBalanceWarning`].
    pub const LOW_BALANCE_WARNING: &'static str = "account.low_balance_warning";
}

impl NotificationEvent for AccountNotification {
    type Payload = AccountNotificationKind;

    fn notification_type(&self) -> &'static str {
        match &self.kind {
            AccountNotificationKind::StatementRequested(_) => Self::STATEMENT_REQUESTED,
            AccountNotificationKind::LowBalanceWarning(_) => Self::LOW_BALANCE_WARNING,
        }
    }

    fn metadata(&self) -> &NotificationMetadata {
        &self.metadata
    }

    fn payload(&self) -> &AccountNotificationKind {
        &self.kind
    }
}
