//! Chronicle outbox worker.
//!
//! Polls the notification outbox and delivers pending account e-mails.

pub mod config;
pub mod error;
pub mod sender;
