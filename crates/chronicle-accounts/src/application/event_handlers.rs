//! Synchronous reactions to account events.

use std::sync::Arc;

use async_trait::async_trait;
use chronicle_core::error::PersistenceError;
use chronicle_core::event::DomainEvent;
use chronicle_persistence::{EventHandler, HandlerRegistry};
use tracing::info;

use crate::domain::events::{AccountEvent, AccountEventKind};

/// Writes every movement of money to the audit log.
#[derive(Debug, Default)]
pub struct LedgerAuditHandler;

#[async_trait]
impl EventHandler<AccountEvent> for LedgerAuditHandler {
    async fn handle(&self, event: &AccountEvent) -> Result<(), PersistenceError> {
        let meta = event.metadata();
        let amount = match &event.kind {
            AccountEventKind::FundsDeposited(payload) => payload.amount,
            AccountEventKind::FundsWithdrawn(payload) => -payload.amount,
            AccountEventKind::AccountOpened(_) | AccountEventKind::AccountClosed(_) => return Ok(()),
        };
        info!(
            target: "audit",
            account_id = %meta.aggregate_id,
            version = meta.version,
            amount,
            created_by = %meta.created_by,
            correlation_id = %meta.correlation_id,
            "ledger movement"
        );
        Ok(())
    }
}

/// Builds the handler registry for account events.
#[must_use]
pub fn account_event_handlers() -> HandlerRegistry<AccountEvent> {
    let audit: Arc<dyn EventHandler<AccountEvent>> = Arc::new(LedgerAuditHandler);
    HandlerRegistry::new()
        .with(AccountEvent::FUNDS_DEPOSITED, audit.clone())
        .with(AccountEvent::FUNDS_WITHDRAWN, audit)
}
