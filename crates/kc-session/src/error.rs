//! Session error types.

use kc_core::EntityType;
use kc_storage::StorageError;
use thiserror::Error;

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// User session not found, or expired.
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Client session not found within user session.
    #[error("Client session not found for client {client_id} in session {session_id}")]
    ClientSessionNotFound {
        /// Parent user session.
        session_id: String,
        /// Client without a session.
        client_id: String,
    },

    /// The realm owning the session does not exist.
    #[error("Realm not found: {0}")]
    RealmNotFound(String),

    /// Operation not valid for this kind of session.
    #[error("Session invalid: {0}")]
    Invalid(String),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SessionError {
    /// Checks if this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::ClientSessionNotFound { .. } | Self::RealmNotFound(_)
        ) || matches!(self, Self::Storage(e) if e.is_not_found())
    }
}

impl From<kc_model::ModelError> for SessionError {
    fn from(err: kc_model::ModelError) -> Self {
        Self::Storage(err.into())
    }
}

impl From<SessionError> for StorageError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Storage(e) => e,
            SessionError::NotFound(id) => Self::not_found(EntityType::UserSession, id),
            SessionError::RealmNotFound(id) => Self::not_found(EntityType::Realm, id),
            SessionError::ClientSessionNotFound { session_id, .. } => {
                Self::not_found(EntityType::UserSession, session_id)
            }
            SessionError::Invalid(msg) => Self::InvalidData(msg),
        }
    }
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
