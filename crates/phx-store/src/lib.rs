//! SQLite-backed state store.
//!
//! Every entity in the data model is persisted here through
//! `tokio_rusqlite::Connection::call`, which marshals a synchronous
//! `rusqlite` closure onto the connection's dedicated thread. Multi-statement
//! operations (`claim_tasks`, `record_deployment_version`,
//! `rollback_deployment_version`) run inside one such closure wrapped in a
//! `BEGIN IMMEDIATE` transaction, which gives them the same row-level
//! serialization a server database would provide without a lock table.
//!
//! Nothing above this crate ever matches on a `rusqlite` or
//! `tokio_rusqlite` error directly — every public method here returns
//! `phx_core::PhoenixResult<T>`.

pub mod agents;
pub mod auth;
pub mod deployments;
pub mod events;
pub mod experiments;
pub mod metrics;
pub mod tasks;
pub mod templates;

use phx_core::PhoenixError;
use std::path::Path;
use tokio_rusqlite::Connection;

pub struct Store {
    pub(crate) conn: Connection,
}

impl Store {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PhoenixError> {
        let conn = Connection::open(path.as_ref())
            .await
            .map_err(|e| PhoenixError::internal(format!("opening store: {e}")))?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, PhoenixError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| PhoenixError::internal(format!("opening in-memory store: {e}")))?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), PhoenixError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await
            .map_err(map_err)
    }
}

const SCHEMA: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA busy_timeout=5000;
PRAGMA foreign_keys=ON;

CREATE TABLE IF NOT EXISTS experiments (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    description   TEXT,
    phase         TEXT NOT NULL,
    config        TEXT NOT NULL,
    status        TEXT NOT NULL,
    metadata      TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_experiments_phase ON experiments(phase);

CREATE TABLE IF NOT EXISTS tasks (
    id            TEXT PRIMARY KEY,
    host_id       TEXT NOT NULL,
    experiment_id TEXT,
    deployment_id TEXT,
    task_type     TEXT NOT NULL,
    action        TEXT NOT NULL,
    priority      INTEGER NOT NULL DEFAULT 1,
    status        TEXT NOT NULL,
    config        TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    assigned_at   TEXT,
    started_at    TEXT,
    completed_at  TEXT,
    result        TEXT NOT NULL,
    error_message TEXT,
    retry_count   INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_tasks_host_status ON tasks(host_id, status, priority DESC, created_at ASC);
CREATE INDEX IF NOT EXISTS idx_tasks_experiment ON tasks(experiment_id);
CREATE INDEX IF NOT EXISTS idx_tasks_deployment ON tasks(deployment_id);
CREATE INDEX IF NOT EXISTS idx_tasks_stale ON tasks(status, assigned_at);

CREATE TABLE IF NOT EXISTS agents (
    host_id         TEXT PRIMARY KEY,
    hostname        TEXT NOT NULL,
    ip              TEXT,
    agent_version   TEXT NOT NULL,
    capabilities    TEXT NOT NULL,
    active_tasks    TEXT NOT NULL,
    resource_usage  TEXT NOT NULL,
    last_heartbeat  TEXT NOT NULL,
    status          TEXT NOT NULL,
    location        TEXT
);

CREATE TABLE IF NOT EXISTS pipeline_deployments (
    id                 TEXT PRIMARY KEY,
    name               TEXT NOT NULL,
    namespace          TEXT NOT NULL,
    template_name      TEXT NOT NULL,
    target_nodes       TEXT NOT NULL,
    parameters         TEXT NOT NULL,
    resource_requirements TEXT NOT NULL,
    status             TEXT NOT NULL,
    phase              TEXT NOT NULL,
    instances          TEXT NOT NULL,
    metrics_snapshot   TEXT NOT NULL,
    current_version    INTEGER NOT NULL DEFAULT 0,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    deleted_at         TEXT
);
CREATE INDEX IF NOT EXISTS idx_deployments_ns ON pipeline_deployments(namespace, deleted_at);

CREATE TABLE IF NOT EXISTS deployment_versions (
    deployment_id        TEXT NOT NULL REFERENCES pipeline_deployments(id),
    version              INTEGER NOT NULL,
    pipeline_config      TEXT NOT NULL,
    parameters_snapshot  TEXT NOT NULL,
    deployed_by          TEXT NOT NULL,
    deployed_at          TEXT NOT NULL,
    status               TEXT NOT NULL,
    rollback_from_version INTEGER,
    notes                TEXT,
    PRIMARY KEY (deployment_id, version)
);

CREATE TABLE IF NOT EXISTS experiment_events (
    id            TEXT PRIMARY KEY,
    experiment_id TEXT NOT NULL REFERENCES experiments(id),
    event_type    TEXT NOT NULL,
    phase         TEXT NOT NULL,
    message       TEXT NOT NULL,
    metadata      TEXT NOT NULL,
    timestamp     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_experiment ON experiment_events(experiment_id, timestamp);

CREATE TABLE IF NOT EXISTS metric_cache (
    experiment_id TEXT NOT NULL,
    timestamp     TEXT NOT NULL,
    metric_name   TEXT NOT NULL,
    variant       TEXT NOT NULL,
    host_id       TEXT NOT NULL,
    value         REAL NOT NULL,
    labels        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metric_cache_lookup
    ON metric_cache(experiment_id, metric_name, variant, timestamp DESC);

CREATE TABLE IF NOT EXISTS pipeline_templates (
    name          TEXT PRIMARY KEY,
    source        TEXT NOT NULL,
    registered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    id            TEXT PRIMARY KEY,
    username      TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    role          TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS token_blacklist (
    jti        TEXT PRIMARY KEY,
    user_id    TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    reason     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_token_blacklist_expiry ON token_blacklist(expires_at);
";

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub(crate) fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

pub(crate) fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{raw}\"");
    serde_json::from_str(&quoted).expect("deserialize enum")
}

pub(crate) fn json_col<T: serde::Serialize>(val: &T) -> String {
    serde_json::to_string(val).expect("serialize json column")
}

pub(crate) fn from_json_col<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    serde_json::from_str(raw).expect("deserialize json column")
}

pub(crate) fn to_rfc3339(dt: chrono::DateTime<chrono::Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn from_rfc3339(raw: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .expect("valid timestamp")
        .with_timezone(&chrono::Utc)
}

/// Maps a `tokio_rusqlite`/`rusqlite` error onto the shared taxonomy: a
/// unique/foreign-key violation is a `Conflict`, everything else is
/// `Internal`. Store callers never see a raw database error.
pub(crate) fn map_err(err: tokio_rusqlite::Error) -> PhoenixError {
    use rusqlite::Error as RusqliteError;
    let is_constraint = match &err {
        tokio_rusqlite::Error::Rusqlite(RusqliteError::SqliteFailure(e, _)) => {
            matches!(
                e.code,
                rusqlite::ErrorCode::ConstraintViolation
            )
        }
        _ => false,
    };
    if is_constraint {
        PhoenixError::Conflict(err.to_string())
    } else {
        PhoenixError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_in_memory_and_initializes_schema() {
        let store = Store::open_in_memory().await.unwrap();
        let count: i64 = store
            .conn
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert!(count >= 10);
    }
}
