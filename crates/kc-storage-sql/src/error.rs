//! SQL error mapping.

use kc_core::EntityType;
use kc_storage::StorageError;
use sqlx::Error as SqlxError;

/// `lock_not_available`: the lock timeout elapsed.
pub const LOCK_NOT_AVAILABLE: &str = "55P03";

/// `unique_violation`.
pub const UNIQUE_VIOLATION: &str = "23505";

/// Converts a `SQLx` error to a storage error.
///
/// `entity` names the row being written, so a unique violation can be
/// reported as a duplicate id.
#[allow(clippy::needless_pass_by_value)]
pub fn from_sqlx_error(err: SqlxError, entity: Option<(EntityType, &str)>) -> StorageError {
    match err {
        SqlxError::Database(db_err) => match db_err.code().as_deref() {
            Some(LOCK_NOT_AVAILABLE) => {
                tracing::debug!(error = %db_err, "Row lock not acquired in time");
                StorageError::LockTimeout(db_err.message().to_string())
            }
            Some(UNIQUE_VIOLATION) => match entity {
                Some((entity_type, id)) => StorageError::duplicate_id(entity_type, id),
                None => StorageError::Query(db_err.to_string()),
            },
            _ => StorageError::Query(db_err.to_string()),
        },
        SqlxError::PoolTimedOut => StorageError::Connection("Connection pool timeout".to_string()),
        SqlxError::PoolClosed => StorageError::Connection("Connection pool closed".to_string()),
        SqlxError::Io(e) => StorageError::Connection(e.to_string()),
        SqlxError::ColumnDecode { .. } | SqlxError::Decode(_) => StorageError::Serialization(err.to_string()),
        _ => StorageError::Internal(err.to_string()),
    }
}

/// Shorthand for errors not tied to a single row.
pub fn query_error(err: SqlxError) -> StorageError {
    from_sqlx_error(err, None)
}
