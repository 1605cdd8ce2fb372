//! Model error types.

use kc_core::EntityType;
use thiserror::Error;

/// Errors raised by entity invariants.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    /// The entity already carries a different id.
    #[error("{entity_type} already has id '{existing}', cannot reassign to '{attempted}'")]
    IdAlreadyAssigned {
        /// Type of entity.
        entity_type: EntityType,
        /// Id currently assigned.
        existing: String,
        /// Id that was rejected.
        attempted: String,
    },

    /// An empty id was supplied.
    #[error("{0} id must not be empty")]
    EmptyId(EntityType),
}

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;
