//! Chronicle outbox worker entry point.

use std::error::Error;
use std::sync::Arc;

use chronicle_dispatcher::config::WorkerConfig;
use chronicle_dispatcher::error::WorkerError;
use chronicle_dispatcher::sender::LoggingEmailSender;
use chronicle_event_store::{PgDatabase, schema};
use chronicle_persistence::NotificationDispatcher;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing subscriber.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting Chronicle outbox worker");

    let config = WorkerConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .map_err(WorkerError::from)?;

    if config.install_schema {
        schema::install(&pool).await.map_err(WorkerError::from)?;
        tracing::info!("Schema installed");
    }

    let dispatcher = NotificationDispatcher::new(
        Arc::new(PgDatabase::new(pool)),
        Arc::new(LoggingEmailSender::new()),
        config.dispatcher,
    );

    // Stop polling on Ctrl-C; the cycle in flight still commits.
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    let signals = tokio::spawn(async move {
        let received = tokio::signal::ctrl_c().await;
        shutdown.cancel();
        received
    });

    dispatcher.run(cancel).await;

    if signals.is_finished() {
        signals.await?.map_err(WorkerError::from)?;
    } else {
        signals.abort();
    }

    tracing::info!("Chronicle outbox worker stopped");
    Ok(())
}
