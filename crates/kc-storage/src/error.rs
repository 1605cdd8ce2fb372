//! Storage error types.

use kc_core::EntityType;
use kc_model::ModelError;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Entity not found where one was required.
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound {
        /// Type of entity.
        entity_type: EntityType,
        /// Entity ID.
        id: String,
    },

    /// Duplicate id or unique field.
    #[error("Duplicate {entity_type}: {field} '{value}' already exists")]
    Duplicate {
        /// Type of entity.
        entity_type: EntityType,
        /// Field that caused the conflict.
        field: &'static str,
        /// Conflicting value.
        value: String,
    },

    /// A pessimistic lock was not acquired in time.
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// A backend schema or mode check failed.
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    /// The stored version moved since the entity was read.
    #[error("Version conflict on {entity_type} {id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Type of entity.
        entity_type: EntityType,
        /// Entity ID.
        id: String,
        /// Version the caller read.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// A realm-partitioned backend was used without an active realm.
    #[error("No realm set for realm-partitioned {0} storage")]
    RealmNotSet(EntityType),

    /// Malformed criteria.
    #[error("Invalid criteria: {0}")]
    InvalidCriteria(String),

    /// Invalid data.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Transaction state error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Database connection error.
    #[error("Database connection error: {0}")]
    Connection(String),

    /// Database query error.
    #[error("Database query error: {0}")]
    Query(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error.
    #[error("Internal storage error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Creates a not found error for an entity.
    #[must_use]
    pub fn not_found(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type,
            id: id.into(),
        }
    }

    /// Creates a duplicate error.
    #[must_use]
    pub fn duplicate(entity_type: EntityType, field: &'static str, value: impl Into<String>) -> Self {
        Self::Duplicate {
            entity_type,
            field,
            value: value.into(),
        }
    }

    /// Creates a duplicate id error.
    #[must_use]
    pub fn duplicate_id(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self::duplicate(entity_type, "id", id)
    }

    /// Checks if this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Checks if this is a duplicate error.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }

    /// Whether the caller may retry the whole unit of work.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout(_) | Self::VersionConflict { .. })
    }

    /// Whether this is an infrastructure failure rather than a contract
    /// violation the providers handle.
    #[must_use]
    pub const fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout(_)
                | Self::ConsistencyViolation(_)
                | Self::Connection(_)
                | Self::Query(_)
                | Self::Internal(_)
        )
    }
}

impl From<ModelError> for StorageError {
    fn from(err: ModelError) -> Self {
        Self::InvalidData(err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
