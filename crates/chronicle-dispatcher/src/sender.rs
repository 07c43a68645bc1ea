//! E-mail delivery for account notifications.
//!
//! The worker has no mail relay of its own: messages are rendered and written
//! to the log, which is where an SMTP adapter would plug in.

use async_trait::async_trait;
use chronicle_accounts::domain::notifications::{AccountNotification, AccountNotificationKind};
use chronicle_core::codec::{Codec, JsonCodec};
use chronicle_core::entity::StoredNotification;
use chronicle_core::error::PersistenceError;
use chronicle_persistence::NotificationSender;
use tracing::info;

/// A rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    /// Recipient address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

impl Email {
    /// Renders an account notification payload.
    #[must_use]
    pub fn render(kind: &AccountNotificationKind) -> Self {
        match kind {
            AccountNotificationKind::StatementRequested(statement) => Self {
                to: statement.email.clone(),
                subject: "Your account statement".to_owned(),
                body: format!("Your current balance is {}.", statement.balance),
            },
            AccountNotificationKind::LowBalanceWarning(warning) => Self {
                to: warning.email.clone(),
                subject: "Low balance warning".to_owned(),
                body: format!(
                    "Your balance of {} is below your warning threshold of {}.",
                    warning.balance, warning.threshold
                ),
            },
        }
    }
}

/// Sender that renders account e-mails and logs them.
#[derive(Debug, Clone, Default)]
pub struct LoggingEmailSender<C = JsonCodec> {
    codec: C,
}

impl LoggingEmailSender {
    /// Creates a sender using the JSON codec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C: Codec> LoggingEmailSender<C> {
    /// Decodes and renders a stored notification.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::Delivery` for a notification type this
    /// sender does not know, or `PersistenceError::Codec` for a broken payload.
    pub fn compose(&self, notification: &StoredNotification) -> Result<Email, PersistenceError> {
        match notification.notification_type.as_str() {
            AccountNotification::STATEMENT_REQUESTED | AccountNotification::LOW_BALANCE_WARNING => {
                let kind: AccountNotificationKind = self
                    .codec
                    .decode(&notification.notification_type, &notification.data)?;
                Ok(Email::render(&kind))
            }
            other => Err(PersistenceError::Delivery(format!(
                "no template for notification type {other}"
            ))),
        }
    }
}

#[async_trait]
impl<C: Codec> NotificationSender for LoggingEmailSender<C> {
    async fn send(&self, notification: &StoredNotification) -> Result<(), PersistenceError> {
        let email = self.compose(notification)?;
        info!(
            notification_id = %notification.notification_id,
            aggregate_id = %notification.aggregate_id,
            to = %email.to,
            subject = %email.subject,
            "email sent"
        );
        Ok(())
    }
}
