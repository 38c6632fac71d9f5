//! Postgres schema of the event log, the engine's bookkeeping tables and the
//! built-in IAM projections.
//!
//! All statements are idempotent (`IF NOT EXISTS`) so [`ensure_schema`] can
//! run on every start.

use sqlx::PgPool;
use tracing::{info, instrument};

use crate::projection::StorageError;

pub const CREATE_PROJECTIONS_SCHEMA: &str = "CREATE SCHEMA IF NOT EXISTS projections";

pub const CREATE_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS events (
    sequence                         BIGSERIAL PRIMARY KEY,
    instance_id                      TEXT NOT NULL,
    aggregate_type                   TEXT NOT NULL,
    aggregate_id                     TEXT NOT NULL,
    event_type                       TEXT NOT NULL,
    previous_aggregate_sequence      BIGINT NOT NULL DEFAULT 0,
    previous_aggregate_type_sequence BIGINT NOT NULL DEFAULT 0,
    creation_date                    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    payload                          JSONB NOT NULL DEFAULT '{}'::jsonb
)";

pub const CREATE_EVENTS_INDEXES: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_instance_type_sequence
    ON events (instance_id, aggregate_type, sequence)";

pub const CREATE_EVENTS_CREATION_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_creation_date
    ON events (creation_date, instance_id)";

pub const CREATE_CURRENT_SEQUENCES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS projections.current_sequences (
    projection_name  TEXT NOT NULL,
    aggregate_type   TEXT NOT NULL,
    instance_id      TEXT NOT NULL,
    current_sequence BIGINT NOT NULL,
    updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (projection_name, aggregate_type, instance_id)
)";

pub const CREATE_FAILED_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS projections.failed_events (
    projection_name TEXT NOT NULL,
    instance_id     TEXT NOT NULL,
    failed_sequence BIGINT NOT NULL,
    failure_count   INTEGER NOT NULL DEFAULT 0,
    error           TEXT NOT NULL DEFAULT '',
    last_failed     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (projection_name, instance_id, failed_sequence)
)";

pub const CREATE_LOCKS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS projections.locks (
    projection_name TEXT NOT NULL,
    instance_id     TEXT NOT NULL,
    locker_id       TEXT NOT NULL,
    locked_until    TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (projection_name, instance_id)
)";

pub const CREATE_USERS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS projections.users (
    instance_id   TEXT NOT NULL,
    id            TEXT NOT NULL,
    username      TEXT NOT NULL,
    email         TEXT NOT NULL,
    display_name  TEXT,
    state         TEXT NOT NULL,
    creation_date TIMESTAMPTZ NOT NULL,
    change_date   TIMESTAMPTZ NOT NULL,
    sequence      BIGINT NOT NULL,
    PRIMARY KEY (instance_id, id)
)";

pub const CREATE_ORGS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS projections.orgs (
    instance_id    TEXT NOT NULL,
    id             TEXT NOT NULL,
    name           TEXT NOT NULL,
    primary_domain TEXT,
    state          TEXT NOT NULL,
    creation_date  TIMESTAMPTZ NOT NULL,
    change_date    TIMESTAMPTZ NOT NULL,
    sequence       BIGINT NOT NULL,
    PRIMARY KEY (instance_id, id)
)";

pub const CREATE_ORG_DOMAINS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS projections.org_domains (
    instance_id   TEXT NOT NULL,
    org_id        TEXT NOT NULL,
    domain        TEXT NOT NULL,
    is_primary    BOOLEAN NOT NULL DEFAULT FALSE,
    creation_date TIMESTAMPTZ NOT NULL,
    sequence      BIGINT NOT NULL,
    PRIMARY KEY (instance_id, org_id, domain)
)";

/// Every statement, in execution order.
pub const SCHEMA: &[&str] = &[
    CREATE_PROJECTIONS_SCHEMA,
    CREATE_EVENTS_TABLE,
    CREATE_EVENTS_INDEXES,
    CREATE_EVENTS_CREATION_INDEX,
    CREATE_CURRENT_SEQUENCES_TABLE,
    CREATE_FAILED_EVENTS_TABLE,
    CREATE_LOCKS_TABLE,
    CREATE_USERS_TABLE,
    CREATE_ORGS_TABLE,
    CREATE_ORG_DOMAINS_TABLE,
];

/// Create every table the engine and the built-in projections need.
#[instrument(skip(pool), err)]
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StorageError> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StorageError::database("ensure_schema", e.to_string()))?;
    }
    info!(statements = SCHEMA.len(), "schema ensured");
    Ok(())
}
