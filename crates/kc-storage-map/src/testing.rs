//! Provider wiring for unit tests.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use kc_core::{Clock, KeyType, RemovalEvent, VirtualClock};
use kc_model::{ClientEntity, GroupEntity, RealmEntity, RoleEntity, UserEntity};
use kc_storage::{InvalidationSink, MapTransaction, RealmProvider, StorageResult, StorageTransaction};
use parking_lot::Mutex;

use crate::{
    ConcurrentHashMapStorage, MapClientProvider, MapGroupProvider, MapRealmProvider, MapRoleProvider,
    MapUserProvider,
};

/// Records every removal event it receives.
#[derive(Default)]
pub(crate) struct Recorder {
    events: Mutex<Vec<RemovalEvent>>,
}

#[async_trait]
impl InvalidationSink for Recorder {
    async fn invalidate(&self, event: RemovalEvent) -> StorageResult<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

pub(crate) struct Fixture {
    pub clock: Arc<VirtualClock>,
    pub sink: Arc<Recorder>,
    pub user_store: Arc<ConcurrentHashMapStorage<UserEntity>>,
    pub realm_tx: Arc<MapTransaction<RealmEntity>>,
    pub user_tx: Arc<MapTransaction<UserEntity>>,
    pub realms: Arc<MapRealmProvider>,
    pub clients: MapClientProvider,
    pub groups: MapGroupProvider,
    pub roles: MapRoleProvider,
    pub users: MapUserProvider,
}

fn tx<E: kc_model::SearchableEntity>(
    store: Arc<ConcurrentHashMapStorage<E>>,
    clock: &Arc<VirtualClock>,
) -> Arc<MapTransaction<E>> {
    let clock: Arc<dyn Clock> = clock.clone();
    Arc::new(MapTransaction::new(store, clock))
}

impl Fixture {
    pub async fn with_realm(realm_id: &str) -> Self {
        let clock = Arc::new(VirtualClock::starting_at(1_000_000));
        let sink = Arc::new(Recorder::default());
        let events = Self::weak(&sink);

        let realm_tx = tx(Arc::new(ConcurrentHashMapStorage::new(KeyType::Uuid)), &clock);
        let user_store = Arc::new(ConcurrentHashMapStorage::new(KeyType::Uuid));
        let user_tx = tx(user_store.clone(), &clock);
        let realms = Arc::new(MapRealmProvider::new(realm_tx.clone(), events.clone()));
        let realm_view: Arc<dyn RealmProvider> = realms.clone();

        let fixture = Self {
            clients: MapClientProvider::new(
                tx(Arc::new(ConcurrentHashMapStorage::<ClientEntity>::default()), &clock),
                realm_view.clone(),
                events.clone(),
            ),
            groups: MapGroupProvider::new(
                tx(Arc::new(ConcurrentHashMapStorage::<GroupEntity>::default()), &clock),
                realm_view.clone(),
                events.clone(),
            ),
            roles: MapRoleProvider::new(
                tx(Arc::new(ConcurrentHashMapStorage::<RoleEntity>::default()), &clock),
                realm_view.clone(),
                events.clone(),
            ),
            users: MapUserProvider::new(user_tx.clone(), realm_view, clock.clone(), events),
            clock,
            sink,
            user_store,
            realm_tx,
            user_tx,
            realms,
        };
        fixture
            .realms
            .create_realm(Some(realm_id), realm_id)
            .await
            .expect("realm");
        fixture
    }

    fn weak(sink: &Arc<Recorder>) -> Weak<dyn InvalidationSink> {
        let sink: Arc<dyn InvalidationSink> = sink.clone();
        Arc::downgrade(&sink)
    }

    /// A user provider on a fresh transaction over the same store.
    pub fn reopen_users(&self) -> MapUserProvider {
        let realms: Arc<dyn RealmProvider> = self.realms.clone();
        MapUserProvider::new(
            tx(self.user_store.clone(), &self.clock),
            realms,
            self.clock.clone(),
            Self::weak(&self.sink),
        )
    }

    pub fn events(&self) -> Vec<RemovalEvent> {
        self.sink.events.lock().clone()
    }

    pub async fn commit_realms(&self) {
        self.realm_tx.commit().await.expect("commit realms");
    }
}
