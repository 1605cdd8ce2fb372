//! Explicit backend table.
//!
//! Built once at startup from configuration: each entity type is bound to
//! exactly one backend instance shared by every session.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use kc_core::config::StorageConfig;
use kc_core::{BackendKind, EntityType, KeyType};
use kc_model::{ClientEntity, GroupEntity, RealmEntity, RoleEntity, SearchableEntity, UserEntity};
use kc_session::UserSessionEntity;
use kc_storage::MapStorage;
use kc_storage_map::{ConcurrentHashMapStorage, RealmPartitionedStorage};
use kc_storage_sql::PgMapStorage;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::PgPool;

fn open<E>(kind: BackendKind, key_type: KeyType, pool: Option<&PgPool>) -> kc_core::Result<Arc<dyn MapStorage<E>>>
where
    E: SearchableEntity + Serialize + DeserializeOwned,
{
    let storage: Arc<dyn MapStorage<E>> = match kind {
        BackendKind::ConcurrentMap => Arc::new(ConcurrentHashMapStorage::<E>::new(key_type)),
        BackendKind::RealmPartitioned => Arc::new(RealmPartitionedStorage::<E>::new(key_type)),
        BackendKind::Postgres => {
            let pool = pool.ok_or_else(|| {
                kc_core::Error::Storage(format!("{} is configured for postgres but no pool is open", E::ENTITY_TYPE))
            })?;
            Arc::new(PgMapStorage::<E>::new(pool.clone(), key_type))
        }
    };
    tracing::debug!(entity_type = %E::ENTITY_TYPE, backend = %kind, "Opened storage");
    Ok(storage)
}

/// One backend per entity type.
#[derive(Clone)]
pub struct StorageTable {
    kinds: BTreeMap<EntityType, BackendKind>,
    realms: Arc<dyn MapStorage<RealmEntity>>,
    clients: Arc<dyn MapStorage<ClientEntity>>,
    groups: Arc<dyn MapStorage<GroupEntity>>,
    roles: Arc<dyn MapStorage<RoleEntity>>,
    users: Arc<dyn MapStorage<UserEntity>>,
    user_sessions: Arc<dyn MapStorage<UserSessionEntity>>,
}

impl fmt::Debug for StorageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.kinds.iter().map(|(t, k)| (t.as_str(), k.to_string()))).finish()
    }
}

impl StorageTable {
    /// Opens the backend configured for every entity type.
    ///
    /// ## Errors
    ///
    /// Returns an error if a type is routed to PostgreSQL without `pool`.
    pub fn build(config: &StorageConfig, pool: Option<&PgPool>) -> kc_core::Result<Self> {
        let key_type = config.key_type;
        let kind = |t| config.backend_for(t);
        Ok(Self {
            kinds: EntityType::ALL.into_iter().map(|t| (t, kind(t))).collect(),
            realms: open(kind(EntityType::Realm), key_type, pool)?,
            clients: open(kind(EntityType::Client), key_type, pool)?,
            groups: open(kind(EntityType::Group), key_type, pool)?,
            roles: open(kind(EntityType::Role), key_type, pool)?,
            users: open(kind(EntityType::User), key_type, pool)?,
            user_sessions: open(kind(EntityType::UserSession), key_type, pool)?,
        })
    }

    /// Every type in one concurrent map per type.
    #[must_use]
    pub fn in_memory(key_type: KeyType) -> Self {
        Self {
            kinds: EntityType::ALL.into_iter().map(|t| (t, BackendKind::ConcurrentMap)).collect(),
            realms: Arc::new(ConcurrentHashMapStorage::new(key_type)),
            clients: Arc::new(ConcurrentHashMapStorage::new(key_type)),
            groups: Arc::new(ConcurrentHashMapStorage::new(key_type)),
            roles: Arc::new(ConcurrentHashMapStorage::new(key_type)),
            users: Arc::new(ConcurrentHashMapStorage::new(key_type)),
            user_sessions: Arc::new(ConcurrentHashMapStorage::new(key_type)),
        }
    }

    /// Backend kind serving `entity_type`.
    #[must_use]
    pub fn kind(&self, entity_type: EntityType) -> BackendKind {
        self.kinds.get(&entity_type).copied().unwrap_or(BackendKind::ConcurrentMap)
    }

    /// Releases every backend's hold on a removed realm. Returns how many
    /// backends held one.
    pub fn release_realm(&self, realm_id: &str) -> usize {
        let released = [
            self.clients.release_realm(realm_id),
            self.groups.release_realm(realm_id),
            self.roles.release_realm(realm_id),
            self.users.release_realm(realm_id),
            self.user_sessions.release_realm(realm_id),
        ];
        released.into_iter().filter(|r| *r).count()
    }

    /// Realm storage.
    #[must_use]
    pub fn realms(&self) -> Arc<dyn MapStorage<RealmEntity>> {
        Arc::clone(&self.realms)
    }

    /// Client storage.
    #[must_use]
    pub fn clients(&self) -> Arc<dyn MapStorage<ClientEntity>> {
        Arc::clone(&self.clients)
    }

    /// Group storage.
    #[must_use]
    pub fn groups(&self) -> Arc<dyn MapStorage<GroupEntity>> {
        Arc::clone(&self.groups)
    }

    /// Role storage.
    #[must_use]
    pub fn roles(&self) -> Arc<dyn MapStorage<RoleEntity>> {
        Arc::clone(&self.roles)
    }

    /// User storage.
    #[must_use]
    pub fn users(&self) -> Arc<dyn MapStorage<UserEntity>> {
        Arc::clone(&self.users)
    }

    /// User session storage.
    #[must_use]
    pub fn user_sessions(&self) -> Arc<dyn MapStorage<UserSessionEntity>> {
        Arc::clone(&self.user_sessions)
    }
}
