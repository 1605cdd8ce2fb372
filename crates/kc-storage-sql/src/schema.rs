//! Document table schema and the startup consistency check.
//!
//! Every entity type shares one table, `kc_entity`, keyed by
//! `(entity_type, id)`. The entity itself is stored as a JSONB document;
//! `version` is the column the optimistic compare/replace runs against.

use kc_storage::{StorageError, StorageResult};
use sqlx::PgPool;

use crate::error::query_error;

/// Schema version this build writes and expects.
pub const SCHEMA_VERSION: i32 = 1;

/// Advisory lock key serializing concurrent migrations across nodes.
const MIGRATION_LOCK: i64 = 0x6b63_5f73_6368_656d;

const CREATE_VERSION_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS kc_schema_version (
    id      INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL
)";

const CREATE_ENTITY_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS kc_entity (
    entity_type TEXT   NOT NULL,
    id          TEXT   NOT NULL,
    realm_id    TEXT,
    version     BIGINT NOT NULL DEFAULT 0,
    data        JSONB  NOT NULL,
    PRIMARY KEY (entity_type, id)
)";

const CREATE_REALM_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS kc_entity_realm_idx ON kc_entity (entity_type, realm_id)";

/// Isolation levels weaker than this lose the read-your-writes guarantee.
const ACCEPTED_ISOLATION: [&str; 3] = ["read committed", "repeatable read", "serializable"];

/// Creates the tables if missing and records the schema version.
///
/// Runs under a transaction-scoped advisory lock, so concurrent nodes
/// migrate one at a time.
///
/// ## Errors
///
/// Returns [`StorageError::ConsistencyViolation`] if the database carries a
/// newer schema, or a query error.
pub async fn migrate(pool: &PgPool) -> StorageResult<()> {
    let mut tx = pool.begin().await.map_err(query_error)?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

    for statement in [CREATE_VERSION_TABLE, CREATE_ENTITY_TABLE, CREATE_REALM_INDEX] {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
    }

    let current: Option<i32> = sqlx::query_scalar("SELECT version FROM kc_schema_version WHERE id = 1")
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_error)?;
    match current {
        Some(version) if version > SCHEMA_VERSION => {
            return Err(StorageError::ConsistencyViolation(format!(
                "database schema version {version} is newer than supported version {SCHEMA_VERSION}"
            )));
        }
        Some(version) if version == SCHEMA_VERSION => {}
        _ => {
            sqlx::query(
                "INSERT INTO kc_schema_version (id, version) VALUES (1, $1) \
                 ON CONFLICT (id) DO UPDATE SET version = EXCLUDED.version",
            )
            .bind(SCHEMA_VERSION)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
            tracing::info!(version = SCHEMA_VERSION, "Applied storage schema");
        }
    }

    tx.commit().await.map_err(query_error)
}

/// Verifies the database before first use.
///
/// ## Errors
///
/// Returns [`StorageError::ConsistencyViolation`] if the schema version is
/// missing or different, or the server isolation level is below read
/// committed.
pub async fn check_consistency(pool: &PgPool) -> StorageResult<()> {
    let version: Option<i32> = sqlx::query_scalar("SELECT version FROM kc_schema_version WHERE id = 1")
        .fetch_optional(pool)
        .await
        .map_err(query_error)?;
    if version != Some(SCHEMA_VERSION) {
        let err = StorageError::ConsistencyViolation(format!(
            "expected schema version {SCHEMA_VERSION}, found {version:?}"
        ));
        tracing::error!(error = %err, "Storage consistency check failed");
        return Err(err);
    }

    let isolation: String = sqlx::query_scalar("SHOW transaction_isolation")
        .fetch_one(pool)
        .await
        .map_err(query_error)?;
    check_isolation(&isolation).inspect_err(|e| tracing::error!(error = %e, "Storage consistency check failed"))
}

/// Accepts read committed or stronger.
///
/// ## Errors
///
/// Returns [`StorageError::ConsistencyViolation`] otherwise.
pub fn check_isolation(level: &str) -> StorageResult<()> {
    let level = level.trim().to_ascii_lowercase();
    if ACCEPTED_ISOLATION.contains(&level.as_str()) {
        Ok(())
    } else {
        Err(StorageError::ConsistencyViolation(format!(
            "transaction isolation '{level}' is below read committed"
        )))
    }
}
