//! Cluster coordination errors.

use thiserror::Error;

/// Errors raised by leases, event buses and timers.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The lease or event transport is unreachable.
    #[error("cluster coordination failure: {0}")]
    CoordinationFailure(String),

    /// An event could not be encoded or decoded.
    #[error("cluster event serialization failed: {0}")]
    Serialization(String),

    /// Invalid coordination settings.
    #[error("cluster configuration error: {0}")]
    Configuration(String),

    /// A synchronized task failed.
    #[error("task {task} failed: {message}")]
    TaskFailed {
        /// Task key.
        task: String,
        /// Failure description.
        message: String,
    },
}

impl ClusterError {
    /// Whether the coordination service itself failed, as opposed to the work
    /// run under it.
    #[must_use]
    pub const fn is_coordination_failure(&self) -> bool {
        matches!(self, Self::CoordinationFailure(_))
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<ClusterError> for kc_core::Error {
    fn from(err: ClusterError) -> Self {
        Self::Cluster(err.to_string())
    }
}

/// Converts a `fred` Redis error to a `ClusterError`.
#[allow(clippy::needless_pass_by_value)]
pub(crate) fn from_redis_error(err: fred::error::Error) -> ClusterError {
    match err.kind() {
        fred::error::ErrorKind::Config | fred::error::ErrorKind::Url => ClusterError::Configuration(err.to_string()),
        _ => ClusterError::CoordinationFailure(err.to_string()),
    }
}

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordination_failures_are_classified() {
        assert!(ClusterError::CoordinationFailure("refused".into()).is_coordination_failure());
        assert!(!ClusterError::Serialization("eof".into()).is_coordination_failure());
    }

    #[test]
    fn cluster_errors_are_not_fatal_at_startup() {
        let err: kc_core::Error = ClusterError::CoordinationFailure("refused".into()).into();
        assert!(!err.is_fatal());
    }
}
