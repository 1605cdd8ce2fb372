//! Database connection pool management.

use std::time::Duration;

use kc_core::config::DatabaseConfig;
use kc_storage::StorageError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;

/// Database pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Database connection URL.
    pub url: String,
    /// Maximum number of connections.
    pub max_connections: u32,
    /// Minimum number of connections.
    pub min_connections: u32,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Pessimistic lock timeout applied to every connection. `None` waits
    /// indefinitely.
    pub lock_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/keycloak".to_string(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            lock_timeout: Some(Duration::from_millis(kc_core::config::DEFAULT_LOCK_TIMEOUT_MS.unsigned_abs())),
        }
    }
}

impl PoolConfig {
    /// Creates a new pool configuration.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Pool settings from the database section of the configuration.
    ///
    /// ## Errors
    ///
    /// Returns [`StorageError::Connection`] when no URL is configured.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| StorageError::Connection("no database URL configured".to_string()))?;
        Ok(Self::new(url)
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .lock_timeout(config.lock_timeout()))
    }

    /// Sets the maximum number of connections.
    #[must_use]
    pub const fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the minimum number of connections.
    #[must_use]
    pub const fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the lock timeout; `None` disables it.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// The `SET` statement run on every new connection.
    #[must_use]
    pub fn lock_timeout_statement(&self) -> String {
        let millis = self.lock_timeout.map_or(0, |t| t.as_millis());
        format!("SET lock_timeout = {millis}")
    }
}

/// Creates a `PostgreSQL` connection pool.
///
/// Every connection gets the configured `lock_timeout`. A disabled timeout
/// is logged, since lock contention then blocks indefinitely.
///
/// ## Errors
///
/// Returns an error if the pool cannot be created.
pub async fn create_pool(config: &PoolConfig) -> Result<PgPool, StorageError> {
    if config.lock_timeout.is_none() {
        tracing::warn!("Database lock timeout disabled; lock contention may block indefinitely");
    }
    let statement = config.lock_timeout_statement();

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout)
        .idle_timeout(Some(config.idle_timeout))
        .after_connect(move |conn, _meta| {
            let statement = statement.clone();
            Box::pin(async move {
                conn.execute(statement.as_str()).await?;
                Ok(())
            })
        })
        .connect(&config.url)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.lock_timeout_statement(), "SET lock_timeout = 10000");
    }

    #[test]
    fn disabled_lock_timeout_sets_zero() {
        let config = PoolConfig::new("postgres://localhost/test").lock_timeout(None);
        assert_eq!(config.lock_timeout_statement(), "SET lock_timeout = 0");
    }

    #[test]
    fn from_database_section() {
        let section = DatabaseConfig {
            url: Some("postgres://db/kc".to_string()),
            max_connections: 4,
            min_connections: 2,
            lock_timeout_ms: 250,
        };
        let config = PoolConfig::from_config(&section).unwrap();
        assert_eq!(config.url, "postgres://db/kc");
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.lock_timeout, Some(Duration::from_millis(250)));

        let missing = DatabaseConfig::default();
        assert!(PoolConfig::from_config(&missing).is_err());
    }
}
