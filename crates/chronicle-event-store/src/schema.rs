//! Event store database schema.

use sqlx::PgPool;
use tracing::info;

/// SQL to create the domain event log.
pub const CREATE_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS domain_events (
    seq             BIGSERIAL NOT NULL,
    event_id        UUID PRIMARY KEY,
    aggregate_id    TEXT NOT NULL,
    aggregate_type  VARCHAR(255) NOT NULL,
    event_type      VARCHAR(255) NOT NULL,
    event_name      VARCHAR(255) NOT NULL,
    event_data      JSONB NOT NULL,
    version         BIGINT NOT NULL,
    correlation_id  UUID NOT NULL,
    causation_id    UUID NOT NULL,
    created_by      VARCHAR(255) NOT NULL,
    occurred_on     TIMESTAMPTZ NOT NULL,
    created_on      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    is_deleted      BOOLEAN NOT NULL DEFAULT FALSE,
    is_active       BOOLEAN NOT NULL DEFAULT TRUE,
    UNIQUE (aggregate_type, aggregate_id, version)
);

CREATE INDEX IF NOT EXISTS idx_domain_events_log_order
    ON domain_events (aggregate_id, created_on, seq);

CREATE INDEX IF NOT EXISTS idx_domain_events_correlation_id
    ON domain_events (correlation_id);
";

/// SQL to create the notification outbox.
pub const CREATE_NOTIFICATIONS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS notification_events (
    seq                BIGSERIAL NOT NULL,
    notification_id    UUID PRIMARY KEY,
    aggregate_id       TEXT NOT NULL,
    aggregate_type     VARCHAR(255) NOT NULL,
    notification_type  VARCHAR(255) NOT NULL,
    notification_name  VARCHAR(255) NOT NULL,
    data               JSONB NOT NULL,
    caused_by          UUID NULL,
    version            BIGINT NOT NULL,
    state              VARCHAR(32) NOT NULL DEFAULT 'pending',
    attempts           INTEGER NOT NULL DEFAULT 0,
    exception          TEXT NULL,
    created_on         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    delivered_on       TIMESTAMPTZ NULL,
    is_deleted         BOOLEAN NOT NULL DEFAULT FALSE,
    is_active          BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE INDEX IF NOT EXISTS idx_notification_events_pending
    ON notification_events (created_on, seq)
    WHERE is_deleted = FALSE AND is_active = TRUE;
";

/// SQL to create the snapshot store. `version` is a real column so
/// snapshot lookups never reach into the memento document.
pub const CREATE_SNAPSHOTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS snapshot_events (
    seq             BIGSERIAL NOT NULL,
    snapshot_id     UUID PRIMARY KEY,
    aggregate_id    TEXT NOT NULL,
    aggregate_type  VARCHAR(255) NOT NULL,
    memento_type    VARCHAR(255) NOT NULL,
    data            JSONB NOT NULL,
    version         BIGINT NOT NULL,
    created_on      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    is_deleted      BOOLEAN NOT NULL DEFAULT FALSE,
    is_active       BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE INDEX IF NOT EXISTS idx_snapshot_events_aggregate_version
    ON snapshot_events (aggregate_id, version);
";

/// Creates every table and index if missing.
///
/// # Errors
///
/// Returns the underlying `sqlx::Error` if any statement fails.
pub async fn install(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in [
        CREATE_EVENTS_TABLE,
        CREATE_NOTIFICATIONS_TABLE,
        CREATE_SNAPSHOTS_TABLE,
    ] {
        sqlx::raw_sql(statement).execute(pool).await?;
    }
    info!("event store schema installed");
    Ok(())
}
