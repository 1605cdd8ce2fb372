//! Error handling for the storage core.
//!
//! Errors raised while bootstrapping (configuration, backend consistency
//! checks, cluster wiring). Per-operation errors live in the crates that
//! raise them.

use thiserror::Error;

/// Result type alias using the core error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Bootstrap error.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A storage backend could not be initialized.
    #[error("storage initialization failed: {0}")]
    Storage(String),

    /// A backend schema or mode check failed at startup.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    /// Cluster wiring failed.
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Internal error.
    #[error("internal error")]
    Internal,
}

impl Error {
    /// Returns whether startup must be aborted.
    ///
    /// Every bootstrap error is fatal except cluster wiring, which degrades
    /// to single-node coordination.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Cluster(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_violation_is_fatal() {
        let error = Error::ConsistencyViolation("auto-commit enabled".to_string());
        assert!(error.is_fatal());
        assert!(error.to_string().contains("auto-commit"));
    }

    #[test]
    fn cluster_error_is_not_fatal() {
        assert!(!Error::Cluster("redis unreachable".to_string()).is_fatal());
    }

    #[test]
    fn internal_error_is_generic() {
        assert_eq!(Error::Internal.to_string(), "internal error");
    }
}
