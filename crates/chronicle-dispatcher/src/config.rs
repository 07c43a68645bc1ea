//! Worker configuration read from the environment.

use std::str::FromStr;
use std::time::Duration;

use chronicle_persistence::{DispatcherConfig, RetryPolicy};

use crate::error::WorkerError;

/// Default size of the PostgreSQL pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Everything the worker needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Pool size.
    pub max_connections: u32,
    /// Dispatcher loop tuning.
    pub dispatcher: DispatcherConfig,
    /// Create the tables at startup when missing.
    pub install_schema: bool,
}

impl WorkerConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Config` if `DATABASE_URL` is missing or any
    /// variable fails to parse.
    pub fn from_env() -> Result<Self, WorkerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Config` if `DATABASE_URL` is missing or any
    /// variable fails to parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WorkerError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                WorkerError::Config("DATABASE_URL environment variable must be set".into())
            })?;

        let max_connections =
            parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        let batch_size = parse_or(
            &lookup,
            "DISPATCH_BATCH_SIZE",
            DispatcherConfig::DEFAULT_BATCH_SIZE,
        )?;
        if batch_size == 0 {
            return Err(WorkerError::Config(
                "DISPATCH_BATCH_SIZE must be greater than zero".into(),
            ));
        }
        let poll_interval = parse_or(
            &lookup,
            "DISPATCH_POLL_INTERVAL_SECS",
            DispatcherConfig::DEFAULT_POLL_INTERVAL.as_secs(),
        )?;
        if poll_interval == 0 {
            return Err(WorkerError::Config(
                "DISPATCH_POLL_INTERVAL_SECS must be greater than zero".into(),
            ));
        }
        let retry_policy = match parse::<u32>(&lookup, "DISPATCH_MAX_ATTEMPTS")? {
            None => RetryPolicy::Unlimited,
            Some(0) => {
                return Err(WorkerError::Config(
                    "DISPATCH_MAX_ATTEMPTS must be greater than zero".into(),
                ));
            }
            Some(max) => RetryPolicy::MaxAttempts(max),
        };
        let install_schema = parse_or(&lookup, "INSTALL_SCHEMA", true)?;

        Ok(Self {
            database_url,
            max_connections,
            dispatcher: DispatcherConfig {
                batch_size,
                poll_interval: Duration::from_secs(poll_interval),
                retry_policy,
            },
            install_schema,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, WorkerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| WorkerError::Config(format!("{key} is invalid: {e}")))
        })
        .transpose()
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, WorkerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse(lookup, key)?.unwrap_or(default))
}
