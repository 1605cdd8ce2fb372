//! Configuration for the storage core.
//!
//! Loaded from environment variables (and a `.env` file when present) with
//! defaults suitable for a single in-memory node.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::EntityType;

/// Default pessimistic lock timeout for relational backends.
pub const DEFAULT_LOCK_TIMEOUT_MS: i64 = 10_000;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend selection.
    pub storage: StorageConfig,
    /// Relational backend settings.
    pub database: DatabaseConfig,
    /// Cluster coordination settings.
    pub cluster: ClusterConfig,
    /// Session maintenance settings.
    pub sessions: SessionConfig,
}

/// Storage engine backing an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// One in-process concurrent map per entity type.
    ConcurrentMap,
    /// One in-process concurrent map per realm.
    RealmPartitioned,
    /// PostgreSQL document table.
    Postgres,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ConcurrentMap => "concurrent-map",
            Self::RealmPartitioned => "realm-partitioned",
            Self::Postgres => "postgres",
        })
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "concurrent-map" | "chm" | "memory" => Ok(Self::ConcurrentMap),
            "realm-partitioned" | "partitioned" => Ok(Self::RealmPartitioned),
            "postgres" | "postgresql" | "jpa" => Ok(Self::Postgres),
            other => Err(Error::Config(format!("unknown storage backend '{other}'"))),
        }
    }
}

/// How backends generate ids for entities created without one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyType {
    /// Time-ordered UUIDs.
    #[default]
    Uuid,
    /// Per-store decimal counter.
    Sequential,
}

impl FromStr for KeyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uuid" => Ok(Self::Uuid),
            "sequential" | "ulong" => Ok(Self::Sequential),
            other => Err(Error::Config(format!("unknown key type '{other}'"))),
        }
    }
}

/// Backend table configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend used for types without an override.
    pub default_backend: BackendKind,
    /// Per-type backend overrides.
    pub overrides: HashMap<EntityType, BackendKind>,
    /// Id generation strategy.
    pub key_type: KeyType,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_backend: BackendKind::ConcurrentMap,
            overrides: HashMap::new(),
            key_type: KeyType::Uuid,
        }
    }
}

impl StorageConfig {
    /// Backend configured for an entity type.
    #[must_use]
    pub fn backend_for(&self, entity_type: EntityType) -> BackendKind {
        self.overrides
            .get(&entity_type)
            .copied()
            .unwrap_or(self.default_backend)
    }

    /// Sets an override.
    #[must_use]
    pub fn with_backend(mut self, entity_type: EntityType, backend: BackendKind) -> Self {
        self.overrides.insert(entity_type, backend);
        self
    }

    /// Whether any entity type is stored in PostgreSQL.
    #[must_use]
    pub fn uses(&self, backend: BackendKind) -> bool {
        EntityType::ALL
            .into_iter()
            .any(|t| self.backend_for(t) == backend)
    }
}

/// Relational backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL; required when any type uses PostgreSQL.
    pub url: Option<String>,
    /// Maximum pool size.
    pub max_connections: u32,
    /// Minimum pool size.
    pub min_connections: u32,
    /// Pessimistic lock timeout in milliseconds. Negative disables it.
    pub lock_timeout_ms: i64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            min_connections: 1,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

impl DatabaseConfig {
    /// The lock timeout, or `None` when disabled.
    #[must_use]
    pub fn lock_timeout(&self) -> Option<Duration> {
        u64::try_from(self.lock_timeout_ms)
            .ok()
            .map(Duration::from_millis)
    }
}

/// Cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// This node's name.
    pub node_id: String,
    /// Datacenter this node runs in.
    pub site: Option<String>,
    /// Redis URL for leases and events; in-process coordination when absent.
    pub redis_url: Option<String>,
    /// Prefix for every coordination key.
    pub key_prefix: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            site: None,
            redis_url: None,
            key_prefix: "kc".to_string(),
        }
    }
}

/// Session maintenance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval of the cluster-wide expired session sweep, in seconds.
    /// Zero disables the sweep; expiry stays lazy either way.
    pub expiration_sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiration_sweep_interval_secs: 900,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// ## Errors
    ///
    /// Returns an error if a variable holds an unparseable value.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through a variable lookup function.
    ///
    /// ## Errors
    ///
    /// Returns an error if a variable holds an unparseable value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup("KC_STORAGE_DEFAULT") {
            config.storage.default_backend = value.parse()?;
        }
        for entity_type in EntityType::ALL {
            let key = format!("KC_STORAGE_{}", entity_type.env_suffix());
            if let Some(value) = lookup(&key) {
                config.storage.overrides.insert(entity_type, value.parse()?);
            }
        }
        if let Some(value) = lookup("KC_STORAGE_KEY_TYPE") {
            config.storage.key_type = value.parse()?;
        }

        config.database.url = lookup("DATABASE_URL");
        config.database.max_connections =
            parse_or(&lookup, "KC_DB_MAX_CONNECTIONS", config.database.max_connections)?;
        config.database.min_connections =
            parse_or(&lookup, "KC_DB_MIN_CONNECTIONS", config.database.min_connections)?;
        config.database.lock_timeout_ms =
            parse_or(&lookup, "KC_DB_LOCK_TIMEOUT", config.database.lock_timeout_ms)?;

        if let Some(node_id) = lookup("KC_NODE_ID") {
            config.cluster.node_id = node_id;
        }
        config.cluster.site = lookup("KC_SITE");
        config.cluster.redis_url = lookup("REDIS_URL");
        if let Some(prefix) = lookup("KC_CLUSTER_KEY_PREFIX") {
            config.cluster.key_prefix = prefix;
        }

        config.sessions.expiration_sweep_interval_secs = parse_or(
            &lookup,
            "KC_SESSION_SWEEP_INTERVAL",
            config.sessions.expiration_sweep_interval_secs,
        )?;

        config.validate()?;
        tracing::debug!(
            default_backend = %config.storage.default_backend,
            overrides = config.storage.overrides.len(),
            node_id = %config.cluster.node_id,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// ## Errors
    ///
    /// Returns an error if PostgreSQL is selected without a database URL,
    /// realms are routed to a realm-partitioned backend or the pool bounds
    /// are inverted.
    pub fn validate(&self) -> Result<()> {
        if self.storage.uses(BackendKind::Postgres) && self.database.url.is_none() {
            return Err(Error::Config(
                "DATABASE_URL is required when a postgres backend is configured".to_string(),
            ));
        }
        if self.storage.backend_for(EntityType::Realm) == BackendKind::RealmPartitioned {
            return Err(Error::Config(
                "realms cannot be stored in a realm-partitioned backend".to_string(),
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(Error::Config(format!(
                "min connections ({}) exceeds max connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }
        if self.cluster.node_id.is_empty() {
            return Err(Error::Config("node id must not be empty".to_string()));
        }
        Ok(())
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid value for {key}: '{value}'"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_single_in_memory_node() {
        let config = Config::from_lookup(|_| None).unwrap();

        assert_eq!(config.storage.backend_for(EntityType::User), BackendKind::ConcurrentMap);
        assert_eq!(config.database.lock_timeout(), Some(Duration::from_millis(10_000)));
        assert_eq!(config.cluster.key_prefix, "kc");
        assert!(config.cluster.redis_url.is_none());
    }

    #[test]
    fn per_type_overrides_win_over_default() {
        let config = Config::from_lookup(lookup_from(&[
            ("KC_STORAGE_DEFAULT", "concurrent-map"),
            ("KC_STORAGE_USER_SESSION", "realm-partitioned"),
        ]))
        .unwrap();

        assert_eq!(
            config.storage.backend_for(EntityType::UserSession),
            BackendKind::RealmPartitioned
        );
        assert_eq!(config.storage.backend_for(EntityType::Role), BackendKind::ConcurrentMap);
    }

    #[test]
    fn negative_lock_timeout_disables_it() {
        let config = Config::from_lookup(lookup_from(&[("KC_DB_LOCK_TIMEOUT", "-1")])).unwrap();
        assert_eq!(config.database.lock_timeout(), None);
    }

    #[test]
    fn postgres_requires_database_url() {
        let err = Config::from_lookup(lookup_from(&[("KC_STORAGE_REALM", "postgres")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let config = Config::from_lookup(lookup_from(&[
            ("KC_STORAGE_REALM", "postgres"),
            ("DATABASE_URL", "postgres://localhost/keycloak"),
        ]))
        .unwrap();
        assert!(config.storage.uses(BackendKind::Postgres));
    }

    #[test]
    fn realms_cannot_be_partitioned_by_realm() {
        let err = Config::from_lookup(lookup_from(&[("KC_STORAGE_DEFAULT", "realm-partitioned")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let config = Config::from_lookup(lookup_from(&[
            ("KC_STORAGE_DEFAULT", "realm-partitioned"),
            ("KC_STORAGE_REALM", "concurrent-map"),
        ]))
        .unwrap();
        assert_eq!(config.storage.backend_for(EntityType::User), BackendKind::RealmPartitioned);
    }

    #[test]
    fn rejects_unknown_backend_and_bad_numbers() {
        assert!(Config::from_lookup(lookup_from(&[("KC_STORAGE_DEFAULT", "mongo")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("KC_DB_MAX_CONNECTIONS", "many")])).is_err());
    }
}
