//! Worker error types.

use thiserror::Error;

/// Startup and runtime errors for the outbox worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A required environment variable is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database connection or pool error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Signal handling or other I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
