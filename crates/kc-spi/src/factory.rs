//! Process-wide root context.
//!
//! The factory owns everything shared between sessions: configuration, the
//! clock, the backend table, the cluster coordinator and the removal cascade.
//! It is built once at startup; sessions are created from it per unit of
//! work.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use kc_cluster::ClusterCoordinator;
use kc_core::{BackendKind, Clock, Config, EntityType};
use kc_model::Entity;
use kc_storage::{CascadeRegistry, StorageError, StorageResult};
use kc_storage_sql::{check_consistency, create_pool, migrate, PoolConfig};

use crate::registry::StorageTable;
use crate::session::KeycloakSession;

/// Cascade hooks run with the session that raised the event.
pub type SessionCascade = CascadeRegistry<KeycloakSession>;

fn storage_error(err: StorageError) -> kc_core::Error {
    match err {
        StorageError::ConsistencyViolation(msg) => kc_core::Error::ConsistencyViolation(msg),
        other => kc_core::Error::Storage(other.to_string()),
    }
}

/// Root context shared by every session.
pub struct KeycloakSessionFactory {
    config: Config,
    clock: Arc<dyn Clock>,
    storage: StorageTable,
    cluster: Arc<ClusterCoordinator>,
    cascade: SessionCascade,
}

impl fmt::Debug for KeycloakSessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeycloakSessionFactory")
            .field("storage", &self.storage)
            .field("node", &self.cluster.node_id())
            .field("cascade", &self.cascade)
            .finish_non_exhaustive()
    }
}

impl KeycloakSessionFactory {
    /// Opens every configured backend and builds the factory.
    ///
    /// When any entity type lives in Postgres the pool is opened, the schema
    /// migrated and the database checked before first use.
    ///
    /// ## Errors
    ///
    /// Returns [`kc_core::Error::ConsistencyViolation`] if the database fails
    /// its consistency check, and [`kc_core::Error::Storage`] or
    /// [`kc_core::Error::Config`] for other startup failures.
    pub async fn new(config: Config, clock: Arc<dyn Clock>, cluster: Arc<ClusterCoordinator>) -> kc_core::Result<Arc<Self>> {
        config.validate()?;

        let pool = if config.storage.uses(BackendKind::Postgres) {
            let pool_config = PoolConfig::from_config(&config.database).map_err(storage_error)?;
            let pool = create_pool(&pool_config).await.map_err(storage_error)?;
            migrate(&pool).await.map_err(storage_error)?;
            check_consistency(&pool).await.map_err(storage_error)?;
            Some(pool)
        } else {
            None
        };

        let storage = StorageTable::build(&config.storage, pool.as_ref())?;
        tracing::info!(node = %cluster.node_id(), storage = ?storage, "Session factory ready");
        Ok(Self::with_storage(config, clock, cluster, storage))
    }

    /// Builds a factory over an already opened backend table.
    #[must_use]
    pub fn with_storage(
        config: Config,
        clock: Arc<dyn Clock>,
        cluster: Arc<ClusterCoordinator>,
        storage: StorageTable,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            storage,
            cluster,
            cascade: default_cascade(),
        })
    }

    /// A single-node factory over in-memory backends.
    #[must_use]
    pub fn in_memory(config: Config, clock: Arc<dyn Clock>) -> Arc<Self> {
        let cluster = ClusterCoordinator::standalone(config.cluster.node_id.clone(), Arc::clone(&clock));
        let storage = StorageTable::in_memory(config.storage.key_type);
        Self::with_storage(config, clock, cluster, storage)
    }

    /// Opens a new session with its transaction started.
    ///
    /// ## Errors
    ///
    /// Returns an error if the transaction cannot begin.
    pub async fn create(self: &Arc<Self>) -> StorageResult<Arc<KeycloakSession>> {
        let session = KeycloakSession::new(Arc::clone(self));
        session.transaction_manager().begin().await?;
        tracing::trace!(session = %session.id(), "Session opened");
        Ok(session)
    }

    /// Runs `job` in a fresh session, committing on success and rolling back
    /// on failure.
    ///
    /// ## Errors
    ///
    /// Returns the job's error, or the commit failure.
    pub async fn run_in_transaction<T, F>(self: &Arc<Self>, job: F) -> StorageResult<T>
    where
        F: for<'a> FnOnce(&'a KeycloakSession) -> BoxFuture<'a, StorageResult<T>>,
    {
        let session = self.create().await?;
        match job(&session).await {
            Ok(value) => {
                session.commit().await?;
                Ok(value)
            }
            Err(err) => {
                tracing::debug!(session = %session.id(), error = %err, "Job failed, rolling back");
                session.close().await;
                Err(err)
            }
        }
    }

    /// Removes expired user sessions of every realm, including those no
    /// read has touched. Returns how many were removed.
    ///
    /// ## Errors
    ///
    /// Returns the first storage failure; nothing is committed then.
    pub async fn remove_expired_sessions(self: &Arc<Self>) -> StorageResult<u64> {
        let removed = self
            .run_in_transaction(|session| {
                Box::pin(async move {
                    let sessions = session.sessions().await?;
                    let mut removed = 0;
                    for realm in session.realms().await?.get_realms(None, None).await? {
                        if let Some(realm_id) = realm.id() {
                            removed += sessions.remove_expired(realm_id).await?;
                        }
                    }
                    Ok(removed)
                })
            })
            .await?;
        tracing::info!(removed, "Expired sessions removed");
        Ok(removed)
    }

    /// Configuration the factory was built from.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Shared clock.
    #[must_use]
    pub const fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Backend table.
    #[must_use]
    pub const fn storage(&self) -> &StorageTable {
        &self.storage
    }

    /// Cluster coordinator.
    #[must_use]
    pub const fn cluster(&self) -> &Arc<ClusterCoordinator> {
        &self.cluster
    }

    /// Removal cascade.
    #[must_use]
    pub const fn cascade(&self) -> &SessionCascade {
        &self.cascade
    }
}

// Every dependent is cleaned while the removed entity is still readable.
fn default_cascade() -> SessionCascade {
    let mut cascade = SessionCascade::new();

    cascade.before_remove(EntityType::Role, EntityType::Role, "role-composites", |s, e| {
        Box::pin(async move {
            s.roles().await?.remove_role_references(&e.realm_id, &e.id).await?;
            Ok(())
        })
    });
    cascade.before_remove(EntityType::Role, EntityType::Client, "client-scope-mappings", |s, e| {
        Box::pin(async move {
            s.clients().await?.remove_role_references(&e.realm_id, &e.id).await?;
            Ok(())
        })
    });
    cascade.before_remove(EntityType::Role, EntityType::Group, "group-role-mappings", |s, e| {
        Box::pin(async move {
            s.groups().await?.remove_role_references(&e.realm_id, &e.id).await?;
            Ok(())
        })
    });
    cascade.before_remove(EntityType::Role, EntityType::User, "user-role-mappings", |s, e| {
        Box::pin(async move {
            s.users().await?.remove_role_references(&e.realm_id, &e.id).await?;
            Ok(())
        })
    });

    cascade.before_remove(EntityType::Group, EntityType::User, "user-group-memberships", |s, e| {
        Box::pin(async move {
            s.users().await?.remove_group_references(&e.realm_id, &e.id).await?;
            Ok(())
        })
    });

    cascade.before_remove(EntityType::Client, EntityType::Role, "client-roles", |s, e| {
        Box::pin(async move {
            s.roles().await?.remove_client_roles(&e.realm_id, &e.id).await?;
            Ok(())
        })
    });
    cascade.before_remove(EntityType::Client, EntityType::User, "user-consents", |s, e| {
        Box::pin(async move {
            s.users().await?.remove_consents_for_client(&e.realm_id, &e.id).await?;
            Ok(())
        })
    });
    cascade.before_remove(EntityType::Client, EntityType::UserSession, "client-sessions", |s, e| {
        Box::pin(async move {
            s.sessions().await?.on_client_removed(&e.realm_id, &e.id).await?;
            Ok(())
        })
    });

    cascade.before_remove(EntityType::User, EntityType::UserSession, "user-sessions", |s, e| {
        Box::pin(async move {
            s.sessions().await?.remove_user_sessions_by_user(&e.realm_id, &e.id).await?;
            Ok(())
        })
    });

    cascade.before_remove(EntityType::Realm, EntityType::UserSession, "realm-sessions", |s, e| {
        Box::pin(async move {
            s.sessions().await?.remove_all_user_sessions(&e.id).await?;
            Ok(())
        })
    });
    cascade.before_remove(EntityType::Realm, EntityType::User, "realm-users", |s, e| {
        Box::pin(async move {
            s.users().await?.remove_users(&e.id).await?;
            Ok(())
        })
    });
    cascade.before_remove(EntityType::Realm, EntityType::Group, "realm-groups", |s, e| {
        Box::pin(async move {
            s.groups().await?.remove_groups(&e.id).await?;
            Ok(())
        })
    });
    cascade.before_remove(EntityType::Realm, EntityType::Role, "realm-roles", |s, e| {
        Box::pin(async move {
            s.roles().await?.remove_roles(&e.id).await?;
            Ok(())
        })
    });
    cascade.before_remove(EntityType::Realm, EntityType::Client, "realm-clients", |s, e| {
        Box::pin(async move {
            s.clients().await?.remove_clients(&e.id).await?;
            Ok(())
        })
    });
    cascade.after_remove(EntityType::Realm, EntityType::Realm, "realm-partitions", |s, e| {
        Box::pin(async move {
            s.release_realm_on_commit(&e.id);
            Ok(())
        })
    });

    cascade
}
