//! Request-scoped unit of work.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use kc_core::RemovalEvent;
use kc_model::SearchableEntity;
use kc_session::{MapUserSessionProvider, UserSessionProvider};
use kc_storage::{
    ClientProvider, GroupProvider, InvalidationSink, MapStorage, MapTransaction, RealmProvider, RoleProvider,
    StorageResult, StorageTransaction, TransactionManager, UserProvider,
};
use kc_storage_map::{MapClientProvider, MapGroupProvider, MapRealmProvider, MapRoleProvider, MapUserProvider};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::factory::KeycloakSessionFactory;

type Slot<P> = Mutex<Option<Arc<P>>>;

/// One unit of work.
///
/// Providers are created on first use, each over its own transaction
/// enlisted with the session's [`TransactionManager`]; they are dropped with
/// the session and never shared across sessions. The session also receives
/// the providers' removal events and runs the factory's cascade hooks.
pub struct KeycloakSession {
    id: Uuid,
    factory: Arc<KeycloakSessionFactory>,
    manager: TransactionManager,
    this: Weak<KeycloakSession>,
    realm: RwLock<Option<String>>,
    closed: AtomicBool,
    removed_realms: Mutex<Vec<String>>,

    realms: Slot<dyn RealmProvider>,
    clients: Slot<dyn ClientProvider>,
    groups: Slot<dyn GroupProvider>,
    roles: Slot<dyn RoleProvider>,
    users: Slot<dyn UserProvider>,
    sessions: Slot<dyn UserSessionProvider>,
}

impl fmt::Debug for KeycloakSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeycloakSession")
            .field("id", &self.id)
            .field("realm", &*self.realm.read())
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl KeycloakSession {
    pub(crate) fn new(factory: Arc<KeycloakSessionFactory>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: Uuid::now_v7(),
            factory,
            manager: TransactionManager::new(),
            this: this.clone(),
            realm: RwLock::new(None),
            closed: AtomicBool::new(false),
            removed_realms: Mutex::new(Vec::new()),
            realms: Mutex::new(None),
            clients: Mutex::new(None),
            groups: Mutex::new(None),
            roles: Mutex::new(None),
            users: Mutex::new(None),
            sessions: Mutex::new(None),
        })
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// The factory this session belongs to.
    #[must_use]
    pub const fn factory(&self) -> &Arc<KeycloakSessionFactory> {
        &self.factory
    }

    /// The transaction manager driving every provider transaction.
    #[must_use]
    pub const fn transaction_manager(&self) -> &TransactionManager {
        &self.manager
    }

    /// Sets the realm this request works in.
    pub fn set_realm(&self, realm_id: Option<&str>) {
        *self.realm.write() = realm_id.map(str::to_string);
    }

    /// The realm this request works in.
    #[must_use]
    pub fn realm(&self) -> Option<String> {
        self.realm.read().clone()
    }

    /// Releases the backends' hold on `realm_id` once this session commits.
    pub(crate) fn release_realm_on_commit(&self, realm_id: &str) {
        self.removed_realms.lock().push(realm_id.to_string());
    }

    fn events(&self) -> Weak<dyn InvalidationSink> {
        self.this.clone()
    }

    fn transaction<E: SearchableEntity>(&self, storage: Arc<dyn MapStorage<E>>) -> Arc<MapTransaction<E>> {
        Arc::new(MapTransaction::new(storage, Arc::clone(self.factory.clock())))
    }

    // Returns the provider in `slot`, creating and enlisting it on first use.
    async fn provider<P: ?Sized>(
        &self,
        slot: &Slot<P>,
        create: impl FnOnce() -> (Arc<P>, Arc<dyn StorageTransaction>),
    ) -> StorageResult<Arc<P>> {
        let (provider, enlist) = {
            let mut slot = slot.lock();
            match slot.as_ref() {
                Some(provider) => (Arc::clone(provider), None),
                None => {
                    let (provider, tx) = create();
                    *slot = Some(Arc::clone(&provider));
                    (provider, Some(tx))
                }
            }
        };
        if let Some(tx) = enlist {
            self.manager.enlist(tx).await?;
        }
        Ok(provider)
    }

    /// Realm provider.
    ///
    /// ## Errors
    ///
    /// Returns an error if its transaction cannot be enlisted.
    pub async fn realms(&self) -> StorageResult<Arc<dyn RealmProvider>> {
        self.provider(&self.realms, || {
            let tx = self.transaction(self.factory.storage().realms());
            let provider: Arc<dyn RealmProvider> = Arc::new(MapRealmProvider::new(Arc::clone(&tx), self.events()));
            (provider, tx as Arc<dyn StorageTransaction>)
        })
        .await
    }

    /// Client provider.
    ///
    /// ## Errors
    ///
    /// Returns an error if its transaction cannot be enlisted.
    pub async fn clients(&self) -> StorageResult<Arc<dyn ClientProvider>> {
        let realms = self.realms().await?;
        self.provider(&self.clients, || {
            let tx = self.transaction(self.factory.storage().clients());
            let provider: Arc<dyn ClientProvider> =
                Arc::new(MapClientProvider::new(Arc::clone(&tx), realms, self.events()));
            (provider, tx as Arc<dyn StorageTransaction>)
        })
        .await
    }

    /// Group provider.
    ///
    /// ## Errors
    ///
    /// Returns an error if its transaction cannot be enlisted.
    pub async fn groups(&self) -> StorageResult<Arc<dyn GroupProvider>> {
        let realms = self.realms().await?;
        self.provider(&self.groups, || {
            let tx = self.transaction(self.factory.storage().groups());
            let provider: Arc<dyn GroupProvider> =
                Arc::new(MapGroupProvider::new(Arc::clone(&tx), realms, self.events()));
            (provider, tx as Arc<dyn StorageTransaction>)
        })
        .await
    }

    /// Role provider.
    ///
    /// ## Errors
    ///
    /// Returns an error if its transaction cannot be enlisted.
    pub async fn roles(&self) -> StorageResult<Arc<dyn RoleProvider>> {
        let realms = self.realms().await?;
        self.provider(&self.roles, || {
            let tx = self.transaction(self.factory.storage().roles());
            let provider: Arc<dyn RoleProvider> =
                Arc::new(MapRoleProvider::new(Arc::clone(&tx), realms, self.events()));
            (provider, tx as Arc<dyn StorageTransaction>)
        })
        .await
    }

    /// User provider.
    ///
    /// ## Errors
    ///
    /// Returns an error if its transaction cannot be enlisted.
    pub async fn users(&self) -> StorageResult<Arc<dyn UserProvider>> {
        let realms = self.realms().await?;
        self.provider(&self.users, || {
            let tx = self.transaction(self.factory.storage().users());
            let provider: Arc<dyn UserProvider> = Arc::new(MapUserProvider::new(
                Arc::clone(&tx),
                realms,
                Arc::clone(self.factory.clock()),
                self.events(),
            ));
            (provider, tx as Arc<dyn StorageTransaction>)
        })
        .await
    }

    /// User session provider.
    ///
    /// ## Errors
    ///
    /// Returns an error if its transaction cannot be enlisted.
    pub async fn sessions(&self) -> StorageResult<Arc<dyn UserSessionProvider>> {
        let realms = self.realms().await?;
        let clients = self.clients().await?;
        self.provider(&self.sessions, || {
            let tx = self.transaction(self.factory.storage().user_sessions());
            let provider: Arc<dyn UserSessionProvider> = Arc::new(MapUserSessionProvider::new(
                Arc::clone(&tx),
                realms,
                clients,
                Arc::clone(self.factory.clock()),
            ));
            (provider, tx as Arc<dyn StorageTransaction>)
        })
        .await
    }

    /// Commits every provider transaction and closes the session.
    ///
    /// ## Errors
    ///
    /// Returns the first commit failure; everything not yet committed is
    /// rolled back.
    pub async fn commit(&self) -> StorageResult<()> {
        let result = self.manager.commit().await;
        self.closed.store(true, Ordering::SeqCst);
        let removed_realms = std::mem::take(&mut *self.removed_realms.lock());
        match &result {
            Ok(()) => {
                for realm_id in removed_realms {
                    let released = self.factory.storage().release_realm(&realm_id);
                    tracing::debug!(session = %self.id, realm_id = %realm_id, released, "Released removed realm");
                }
            }
            Err(err) => tracing::error!(session = %self.id, error = %err, "Session commit failed"),
        }
        result
    }

    /// Discards every provider transaction and closes the session.
    ///
    /// ## Errors
    ///
    /// Returns an error if the session is not active.
    pub async fn rollback(&self) -> StorageResult<()> {
        let result = self.manager.rollback().await;
        self.closed.store(true, Ordering::SeqCst);
        self.removed_realms.lock().clear();
        result
    }

    /// Closes the session, rolling back if neither commit nor rollback ran.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.removed_realms.lock().clear();
        if self.manager.is_active() {
            tracing::debug!(session = %self.id, "Closing session without commit, rolling back");
            if let Err(err) = self.manager.rollback().await {
                tracing::warn!(session = %self.id, error = %err, "Rollback on close failed");
            }
        }
    }

    /// Whether the session completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InvalidationSink for KeycloakSession {
    async fn invalidate(&self, event: RemovalEvent) -> StorageResult<()> {
        self.factory.cascade().fire(self, &event).await
    }
}

impl Drop for KeycloakSession {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) && self.manager.is_active() {
            tracing::warn!(session = %self.id, "Session dropped without commit or rollback, changes discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use kc_cluster::ClusterCoordinator;
    use kc_core::{BackendKind, Config, EntityType, VirtualClock};
    use kc_storage::StorageError;

    use super::*;

    fn factory() -> Arc<KeycloakSessionFactory> {
        KeycloakSessionFactory::in_memory(Config::default(), Arc::new(VirtualClock::starting_at(0)))
    }

    #[tokio::test]
    async fn providers_are_created_once_per_session() {
        let factory = factory();
        let session = factory.create().await.unwrap();
        let a = session.realms().await.unwrap();
        let b = session.realms().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        session.close().await;
    }

    #[tokio::test]
    async fn commit_publishes_and_rollback_discards() {
        let factory = factory();

        let session = factory.create().await.unwrap();
        session.realms().await.unwrap().create_realm(Some("kept"), "kept").await.unwrap();
        session.commit().await.unwrap();
        assert!(session.is_closed());

        let session = factory.create().await.unwrap();
        session.realms().await.unwrap().create_realm(Some("dropped"), "dropped").await.unwrap();
        session.rollback().await.unwrap();

        let session = factory.create().await.unwrap();
        let realms = session.realms().await.unwrap();
        assert!(realms.get_realm("kept").await.unwrap().is_some());
        assert!(realms.get_realm("dropped").await.unwrap().is_none());
        session.close().await;
    }

    #[tokio::test]
    async fn close_without_commit_rolls_back() {
        let factory = factory();
        let session = factory.create().await.unwrap();
        session.realms().await.unwrap().create_realm(Some("r"), "r").await.unwrap();
        session.close().await;

        let err = session.commit().await.unwrap_err();
        assert!(matches!(err, StorageError::Transaction(_)));
        let check = factory.create().await.unwrap();
        assert!(check.realms().await.unwrap().get_realm("r").await.unwrap().is_none());
        check.close().await;
    }

    #[tokio::test]
    async fn removed_realm_is_released_only_on_commit() {
        let mut config = Config::default();
        config.storage = config.storage.with_backend(EntityType::User, BackendKind::RealmPartitioned);
        let clock: Arc<dyn kc_core::Clock> = Arc::new(VirtualClock::starting_at(0));
        let cluster = ClusterCoordinator::standalone("n1", Arc::clone(&clock));
        let factory = KeycloakSessionFactory::new(config, clock, cluster).await.unwrap();

        let session = factory.create().await.unwrap();
        session.realms().await.unwrap().create_realm(Some("r"), "r").await.unwrap();
        session.users().await.unwrap().add_user("r", None, "alice").await.unwrap();
        session.commit().await.unwrap();

        let session = factory.create().await.unwrap();
        assert!(session.realms().await.unwrap().remove_realm("r").await.unwrap());
        session.rollback().await.unwrap();
        assert_eq!(factory.storage().users().count(Some("r"), &Default::default()).await.unwrap(), 1);

        let session = factory.create().await.unwrap();
        assert!(session.realms().await.unwrap().remove_realm("r").await.unwrap());
        session.commit().await.unwrap();
        assert!(!factory.storage().users().release_realm("r"));
    }

    #[tokio::test]
    async fn realm_context_is_per_session() {
        let factory = factory();
        let a = factory.create().await.unwrap();
        let b = factory.create().await.unwrap();
        a.set_realm(Some("acme"));
        assert_eq!(a.realm().as_deref(), Some("acme"));
        assert_eq!(b.realm(), None);
        a.close().await;
        b.close().await;
    }
}
