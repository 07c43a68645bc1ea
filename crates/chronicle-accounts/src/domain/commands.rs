//! Commands for the Accounts context.

use chronicle_core::id::AggregateId;
use uuid::Uuid;

/// Command to open a new account.
#[derive(Debug, Clone)]
pub struct OpenAccount {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Principal issuing the command.
    pub issued_by: String,
    /// Account holder's name.
    pub owner: String,
    /// Address for statements and warnings.
    pub email: String,
    /// Balance below which a warning is sent.
    pub low_balance_threshold: i64,
}

/// Command to pay money into an account.
#[derive(Debug, Clone)]
pub struct DepositFunds {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Principal issuing the command.
    pub issued_by: String,
    /// The account identifier.
    pub account_id: AggregateId,
    /// Amount in minor units.
    pub amount: i64,
}

/// Command to take money out of an account.
#[derive(Debug, Clone)]
pub struct WithdrawFunds {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Principal issuing the command.
    pub issued_by: String,
    /// The account identifier.
    pub account_id: AggregateId,
    /// Amount in minor units.
    pub amount: i64,
}

/// Command to close an account.
#[derive(Debug, Clone)]
pub struct CloseAccount {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Principal issuing the command.
    pub issued_by: String,
    /// The account identifier.
    pub account_id: AggregateId,
    /// Why the account is being closed.
    pub reason: String,
}

/// Command to e-mail a statement to the holder.
#[derive(Debug, Clone)]
pub struct RequestStatement {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The account identifier.
    pub account_id: AggregateId,
}

/// Command to checkpoint an account's current state.
#[derive(Debug, Clone)]
pub struct SnapshotAccount {
    /// The account identifier.
    pub account_id: AggregateId,
}
