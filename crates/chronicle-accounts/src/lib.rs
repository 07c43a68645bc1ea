//! Chronicle Accounts bounded context.
//!
//! A small ledger of customer accounts. Accounts are event-sourced, can be
//! snapshotted, and queue e-mail notifications through the outbox.

pub mod application;
pub mod domain;
