//! Session provider over a [`MapTransaction`].
//!
//! Persistent sessions go through the session's transaction like any other
//! entity; transient ones are kept in a request-local map owned by the
//! provider and vanish with it. Lazy expiry applies to both.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kc_core::{Clock, EntityType};
use kc_model::{DeepCloner, Entity, SessionSettings};
use kc_storage::{ClientProvider, Criteria, MapTransaction, Operator, Order, QueryParameters, RealmProvider, StorageError};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::client_session::{notes as client_notes, AuthenticatedClientSessionEntity};
use crate::error::{SessionError, SessionResult};
use crate::expiration::{client_session_expiration, user_session_expiration};
use crate::provider::UserSessionProvider;
use crate::user_session::{notes, PersistenceState, UserSessionEntity, UserSessionField};

fn in_realm(realm_id: &str) -> Criteria<UserSessionField> {
    Criteria::new().compare(UserSessionField::RealmId, Operator::Eq, realm_id)
}

fn realm_and_offline(realm_id: &str, offline: bool) -> Criteria<UserSessionField> {
    in_realm(realm_id).compare(UserSessionField::IsOffline, Operator::Eq, offline)
}

fn with_client(realm_id: &str, offline: bool, client_id: &str) -> Criteria<UserSessionField> {
    realm_and_offline(realm_id, offline).compare(UserSessionField::ClientId, Operator::Eq, client_id)
}

fn realm_of(session: &UserSessionEntity) -> SessionResult<String> {
    session
        .realm_id()
        .map(str::to_string)
        .ok_or_else(|| SessionError::Invalid("user session without realm".to_string()))
}

fn id_of(session: &UserSessionEntity) -> SessionResult<String> {
    session
        .id()
        .map(str::to_string)
        .ok_or_else(|| SessionError::Invalid("user session without id".to_string()))
}

/// User session provider over a [`MapTransaction`].
pub struct MapUserSessionProvider {
    tx: Arc<MapTransaction<UserSessionEntity>>,
    realms: Arc<dyn RealmProvider>,
    clients: Arc<dyn ClientProvider>,
    clock: Arc<dyn Clock>,
    transient: Mutex<HashMap<String, UserSessionEntity>>,
}

impl fmt::Debug for MapUserSessionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapUserSessionProvider")
            .field("tx", &self.tx)
            .field("transient", &self.transient.lock().len())
            .finish_non_exhaustive()
    }
}

impl MapUserSessionProvider {
    /// Creates a provider.
    #[must_use]
    pub fn new(
        tx: Arc<MapTransaction<UserSessionEntity>>,
        realms: Arc<dyn RealmProvider>,
        clients: Arc<dyn ClientProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tx,
            realms,
            clients,
            clock,
            transient: Mutex::new(HashMap::new()),
        }
    }

    async fn settings(&self, realm_id: &str) -> SessionResult<SessionSettings> {
        self.realms
            .get_realm(realm_id)
            .await?
            .map(|realm| *realm.session_settings())
            .ok_or_else(|| SessionError::RealmNotFound(realm_id.to_string()))
    }

    // Transient lookup with lazy expiry.
    fn transient_session(&self, realm_id: &str, id: &str) -> Option<UserSessionEntity> {
        let now = self.clock.now_millis();
        let mut transient = self.transient.lock();
        let session = transient.get(id)?;
        if session.is_expired(now) {
            tracing::debug!(id, "Discarding expired transient session");
            transient.remove(id);
            return None;
        }
        (session.realm_id() == Some(realm_id)).then(|| session.clone())
    }

    // Drops expired client sessions, writing the change back.
    async fn admit(&self, mut session: UserSessionEntity) -> SessionResult<UserSessionEntity> {
        if session.remove_expired_client_sessions(self.clock.now_millis()) > 0 {
            self.store(session.clone()).await?;
        }
        Ok(session)
    }

    async fn load(&self, realm_id: &str, id: &str) -> SessionResult<Option<UserSessionEntity>> {
        let session = match self.transient_session(realm_id, id) {
            Some(session) => Some(session),
            None => {
                self.tx.set_realm_id(Some(realm_id));
                self.tx
                    .read(id)
                    .await?
                    .filter(|s| s.realm_id() == Some(realm_id))
            }
        };
        match session {
            Some(session) => Ok(Some(self.admit(session).await?)),
            None => Ok(None),
        }
    }

    async fn select(&self, realm_id: &str, query: QueryParameters<UserSessionField>) -> SessionResult<Vec<UserSessionEntity>> {
        self.tx.set_realm_id(Some(realm_id));
        let mut admitted = Vec::new();
        for session in self.tx.read_all(&query).await? {
            admitted.push(self.admit(session).await?);
        }
        Ok(admitted)
    }

    // Client-keyed queries match on client sessions, so candidates are pruned
    // before the criteria and pagination are applied again.
    async fn select_by_client(
        &self,
        realm_id: &str,
        query: QueryParameters<UserSessionField>,
    ) -> SessionResult<Vec<UserSessionEntity>> {
        let candidates = self.select(realm_id, query.without_pagination()).await?;
        Ok(query.select(candidates)?)
    }

    async fn count_by_client(&self, realm_id: &str, offline: bool, client_id: &str) -> SessionResult<u64> {
        let query = QueryParameters::from(with_client(realm_id, offline, client_id));
        Ok(self.select_by_client(realm_id, query).await?.len() as u64)
    }

    async fn delete_where(&self, realm_id: &str, criteria: Criteria<UserSessionField>) -> SessionResult<u64> {
        self.tx.set_realm_id(Some(realm_id));
        Ok(self.tx.delete_matching(&criteria.into()).await?)
    }

    async fn store(&self, session: UserSessionEntity) -> SessionResult<bool> {
        let realm_id = realm_of(&session)?;
        if session.persistence_state() == PersistenceState::Transient {
            let id = id_of(&session)?;
            let mut transient = self.transient.lock();
            return Ok(match transient.get_mut(&id) {
                Some(slot) => {
                    *slot = session;
                    true
                }
                None => false,
            });
        }
        self.tx.set_realm_id(Some(&realm_id));
        Ok(self.tx.update(session).await?)
    }

    fn retain_transient(&self, keep: impl Fn(&UserSessionEntity) -> bool) -> u64 {
        let mut transient = self.transient.lock();
        let before = transient.len();
        transient.retain(|_, s| keep(s));
        (before - transient.len()) as u64
    }

    async fn first(&self, realm_id: &str, criteria: Criteria<UserSessionField>) -> SessionResult<Option<UserSessionEntity>> {
        Ok(self.select(realm_id, criteria.into()).await?.into_iter().next())
    }

    async fn new_client_session(
        &self,
        realm_id: &str,
        parent: &UserSessionEntity,
        client_id: &str,
    ) -> SessionResult<AuthenticatedClientSessionEntity> {
        let settings = self.settings(realm_id).await?;
        let client = self.clients.get_client_by_id(realm_id, client_id).await?;
        let mut client_session =
            AuthenticatedClientSessionEntity::new(Uuid::new_v4().to_string(), client_id, self.clock.now_millis());
        client_session.set_expiration(client_session_expiration(
            &settings,
            client.as_ref(),
            parent,
            &client_session,
        ));
        Ok(client_session)
    }
}

#[async_trait]
impl UserSessionProvider for MapUserSessionProvider {
    async fn create_user_session(&self, mut session: UserSessionEntity) -> SessionResult<UserSessionEntity> {
        let realm_id = realm_of(&session)?;
        let settings = self.settings(&realm_id).await?;
        session.restart(self.clock.now_millis());
        session.set_expiration(user_session_expiration(&settings, &session));

        if session.persistence_state() == PersistenceState::Transient {
            if session.id().is_none() {
                session.set_id(&self.tx.storage().new_key())?;
            }
            let id = id_of(&session)?;
            let mut transient = self.transient.lock();
            if transient.contains_key(&id) {
                return Err(StorageError::duplicate_id(EntityType::UserSession, id).into());
            }
            transient.insert(id.clone(), session.clone());
            tracing::debug!(realm_id, id, "Created transient user session");
            return Ok(session);
        }

        self.tx.set_realm_id(Some(&realm_id));
        let session = self.tx.create(session).await?;
        tracing::debug!(realm_id, id = ?session.id(), user_id = session.user_id(), "Created user session");
        Ok(session)
    }

    async fn get_user_session(&self, realm_id: &str, id: &str) -> SessionResult<Option<UserSessionEntity>> {
        Ok(self.load(realm_id, id).await?.filter(|s| !s.is_offline()))
    }

    async fn update_user_session(&self, session: UserSessionEntity) -> SessionResult<bool> {
        self.store(session).await
    }

    async fn refresh_user_session(&self, realm_id: &str, id: &str) -> SessionResult<Option<UserSessionEntity>> {
        let Some(mut session) = self.load(realm_id, id).await? else {
            return Ok(None);
        };
        let settings = self.settings(realm_id).await?;
        session.set_last_session_refresh(self.clock.now_millis());
        session.set_expiration(user_session_expiration(&settings, &session));
        self.store(session.clone()).await?;
        Ok(Some(session))
    }

    async fn get_user_sessions(&self, realm_id: &str, user_id: &str) -> SessionResult<Vec<UserSessionEntity>> {
        let criteria = realm_and_offline(realm_id, false).compare(UserSessionField::UserId, Operator::Eq, user_id);
        self.select(realm_id, criteria.into()).await
    }

    async fn get_user_sessions_by_client(
        &self,
        realm_id: &str,
        client_id: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> SessionResult<Vec<UserSessionEntity>> {
        let query = QueryParameters::from(with_client(realm_id, false, client_id))
            .order_by(UserSessionField::LastSessionRefresh, Order::Ascending)
            .pagination(first, max);
        self.select_by_client(realm_id, query).await
    }

    async fn get_user_session_by_broker_session_id(
        &self,
        realm_id: &str,
        broker_session_id: &str,
    ) -> SessionResult<Option<UserSessionEntity>> {
        let criteria = realm_and_offline(realm_id, false).compare(
            UserSessionField::BrokerSessionId,
            Operator::Eq,
            broker_session_id,
        );
        self.first(realm_id, criteria).await
    }

    async fn get_user_sessions_by_broker_user_id(
        &self,
        realm_id: &str,
        broker_user_id: &str,
    ) -> SessionResult<Vec<UserSessionEntity>> {
        let criteria =
            realm_and_offline(realm_id, false).compare(UserSessionField::BrokerUserId, Operator::Eq, broker_user_id);
        self.select(realm_id, criteria.into()).await
    }

    async fn get_active_user_sessions(&self, realm_id: &str, client_id: &str) -> SessionResult<u64> {
        self.count_by_client(realm_id, false, client_id).await
    }

    async fn get_active_client_session_stats(
        &self,
        realm_id: &str,
        offline: bool,
    ) -> SessionResult<BTreeMap<String, u64>> {
        let mut stats = BTreeMap::new();
        for session in self.select(realm_id, realm_and_offline(realm_id, offline).into()).await? {
            for client_id in session.client_sessions().keys() {
                *stats.entry(client_id.clone()).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }

    async fn remove_user_session(&self, realm_id: &str, id: &str) -> SessionResult<bool> {
        if self.transient_session(realm_id, id).is_some() {
            return Ok(self.transient.lock().remove(id).is_some());
        }
        let criteria = realm_and_offline(realm_id, false).compare(UserSessionField::Id, Operator::Eq, id);
        let removed = self.delete_where(realm_id, criteria).await? > 0;
        if removed {
            tracing::debug!(realm_id, id, "Removed user session");
        }
        Ok(removed)
    }

    async fn remove_user_sessions_by_user(&self, realm_id: &str, user_id: &str) -> SessionResult<u64> {
        let transient = self.retain_transient(|s| s.realm_id() != Some(realm_id) || s.user_id() != user_id);
        let criteria = in_realm(realm_id).compare(UserSessionField::UserId, Operator::Eq, user_id);
        Ok(transient + self.delete_where(realm_id, criteria).await?)
    }

    async fn remove_user_sessions(&self, realm_id: &str) -> SessionResult<u64> {
        let transient = self.retain_transient(|s| s.realm_id() != Some(realm_id));
        Ok(transient + self.delete_where(realm_id, realm_and_offline(realm_id, false)).await?)
    }

    async fn remove_all_user_sessions(&self, realm_id: &str) -> SessionResult<u64> {
        let transient = self.retain_transient(|s| s.realm_id() != Some(realm_id));
        let removed = transient + self.delete_where(realm_id, in_realm(realm_id)).await?;
        tracing::debug!(realm_id, removed, "Removed all user sessions of realm");
        Ok(removed)
    }

    async fn remove_expired(&self, realm_id: &str) -> SessionResult<u64> {
        let now = self.clock.now_millis();
        let transient = self.retain_transient(|s| s.realm_id() != Some(realm_id) || !s.is_expired(now));
        self.tx.set_realm_id(Some(realm_id));
        let stored = self.tx.delete_expired(&in_realm(realm_id).into()).await?;
        tracing::debug!(realm_id, removed = stored + transient, "Removed expired user sessions");
        Ok(stored + transient)
    }

    async fn create_client_session(
        &self,
        realm_id: &str,
        user_session_id: &str,
        client_id: &str,
    ) -> SessionResult<AuthenticatedClientSessionEntity> {
        let mut session = self
            .load(realm_id, user_session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(user_session_id.to_string()))?;
        let client_session = self.new_client_session(realm_id, &session, client_id).await?;
        session.add_client_session(client_session.clone());
        self.store(session).await?;
        tracing::trace!(realm_id, user_session_id, client_id, "Created client session");
        Ok(client_session)
    }

    async fn get_client_session(
        &self,
        realm_id: &str,
        user_session_id: &str,
        client_id: &str,
        offline: bool,
    ) -> SessionResult<Option<AuthenticatedClientSessionEntity>> {
        let session = if offline {
            self.get_offline_user_session(realm_id, user_session_id).await?
        } else {
            self.get_user_session(realm_id, user_session_id).await?
        };
        Ok(session.and_then(|s| s.client_session(client_id).cloned()))
    }

    async fn remove_client_session(
        &self,
        realm_id: &str,
        user_session_id: &str,
        client_id: &str,
    ) -> SessionResult<bool> {
        let Some(mut session) = self.load(realm_id, user_session_id).await? else {
            return Ok(false);
        };
        if session.remove_client_session(client_id).is_none() {
            return Ok(false);
        }
        self.store(session).await
    }

    async fn on_client_removed(&self, realm_id: &str, client_id: &str) -> SessionResult<u64> {
        let mut changed = 0;
        for session in self.transient.lock().values_mut() {
            if session.realm_id() == Some(realm_id) && session.remove_client_session(client_id).is_some() {
                changed += 1;
            }
        }

        let criteria = in_realm(realm_id).compare(UserSessionField::ClientId, Operator::Eq, client_id);
        for mut session in self.select(realm_id, criteria.into()).await? {
            if session.remove_client_session(client_id).is_some() && self.store(session).await? {
                changed += 1;
            }
        }
        tracing::debug!(realm_id, client_id, changed, "Dropped client sessions of removed client");
        Ok(changed)
    }

    async fn create_offline_user_session(&self, realm_id: &str, online_id: &str) -> SessionResult<UserSessionEntity> {
        let mut online = self
            .get_user_session(realm_id, online_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(online_id.to_string()))?;
        let settings = self.settings(realm_id).await?;

        let mut offline = DeepCloner::new()
            .from_with_id(None, &online)
            .with_persistence_state(PersistenceState::Persistent);
        offline.set_offline(true);
        offline.clear_client_sessions();
        offline.set_note(notes::CORRESPONDING_SESSION_ID, online_id);
        offline.restart(self.clock.now_millis());
        offline.set_expiration(user_session_expiration(&settings, &offline));

        self.tx.set_realm_id(Some(realm_id));
        let offline = self.tx.create(offline).await?;
        let offline_id = id_of(&offline)?;

        online.set_note(notes::CORRESPONDING_SESSION_ID, offline_id.as_str());
        self.store(online).await?;
        tracing::debug!(realm_id, online_id, offline_id, "Created offline user session");
        Ok(offline)
    }

    async fn get_offline_user_session(&self, realm_id: &str, id: &str) -> SessionResult<Option<UserSessionEntity>> {
        match self.load(realm_id, id).await? {
            Some(session) if session.is_offline() => Ok(Some(session)),
            Some(online) => match online.corresponding_session_id() {
                Some(offline_id) => Ok(self.load(realm_id, offline_id).await?.filter(UserSessionEntity::is_offline)),
                None => Ok(None),
            },
            None => {
                let criteria = realm_and_offline(realm_id, true).compare_keyed(
                    UserSessionField::Note,
                    notes::CORRESPONDING_SESSION_ID,
                    Operator::Eq,
                    id,
                );
                self.first(realm_id, criteria).await
            }
        }
    }

    async fn get_offline_user_sessions(
        &self,
        realm_id: &str,
        user_id: &str,
    ) -> SessionResult<Vec<UserSessionEntity>> {
        let criteria = realm_and_offline(realm_id, true).compare(UserSessionField::UserId, Operator::Eq, user_id);
        self.select(realm_id, criteria.into()).await
    }

    async fn get_offline_user_session_by_broker_session_id(
        &self,
        realm_id: &str,
        broker_session_id: &str,
    ) -> SessionResult<Option<UserSessionEntity>> {
        let criteria = realm_and_offline(realm_id, true).compare(
            UserSessionField::BrokerSessionId,
            Operator::Eq,
            broker_session_id,
        );
        self.first(realm_id, criteria).await
    }

    async fn get_offline_user_sessions_by_client(
        &self,
        realm_id: &str,
        client_id: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> SessionResult<Vec<UserSessionEntity>> {
        let query = QueryParameters::from(with_client(realm_id, true, client_id))
            .order_by(UserSessionField::LastSessionRefresh, Order::Ascending)
            .pagination(first, max);
        self.select_by_client(realm_id, query).await
    }

    async fn create_offline_client_session(
        &self,
        realm_id: &str,
        client_session: &AuthenticatedClientSessionEntity,
        offline_session_id: &str,
    ) -> SessionResult<AuthenticatedClientSessionEntity> {
        let mut offline = self
            .get_offline_user_session(realm_id, offline_session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(offline_session_id.to_string()))?;

        let mut copy = self
            .new_client_session(realm_id, &offline, &client_session.client_id)
            .await?;
        let started_at = copy.note(client_notes::STARTED_AT).map(str::to_string);
        copy.set_notes(client_session.notes().clone());
        if let Some(started_at) = started_at {
            copy.set_note(client_notes::STARTED_AT, started_at);
        }
        copy.action.clone_from(&client_session.action);
        copy.protocol.clone_from(&client_session.protocol);
        copy.redirect_uri.clone_from(&client_session.redirect_uri);

        offline.add_client_session(copy.clone());
        self.store(offline).await?;
        Ok(copy)
    }

    async fn remove_offline_user_session(&self, realm_id: &str, id: &str) -> SessionResult<bool> {
        let Some(offline) = self.get_offline_user_session(realm_id, id).await? else {
            return Ok(false);
        };
        let offline_id = id_of(&offline)?;
        self.tx.set_realm_id(Some(realm_id));
        let removed = self.tx.delete(&offline_id).await?;

        if let Some(online_id) = offline.corresponding_session_id() {
            if let Some(mut online) = self.get_user_session(realm_id, online_id).await? {
                if online.corresponding_session_id() == Some(offline_id.as_str()) {
                    online.remove_note(notes::CORRESPONDING_SESSION_ID);
                    self.store(online).await?;
                }
            }
        }
        tracing::debug!(realm_id, offline_id, "Removed offline user session");
        Ok(removed)
    }

    async fn get_offline_sessions_count(&self, realm_id: &str, client_id: &str) -> SessionResult<u64> {
        self.count_by_client(realm_id, true, client_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;
    use std::time::Duration;

    use kc_core::{KeyType, VirtualClock};
    use kc_model::{ClientEntity, RealmEntity};
    use kc_storage::{InvalidationSink, MapStorage, StorageResult, StorageTransaction};
    use kc_storage_map::{ConcurrentHashMapStorage, MapClientProvider, MapRealmProvider};

    use super::*;

    const T0: i64 = 1_000_000;

    struct NoopSink;

    #[async_trait]
    impl InvalidationSink for NoopSink {
        async fn invalidate(&self, _event: kc_core::RemovalEvent) -> StorageResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        clock: Arc<VirtualClock>,
        store: Arc<ConcurrentHashMapStorage<UserSessionEntity>>,
        tx: Arc<MapTransaction<UserSessionEntity>>,
        realms: Arc<dyn RealmProvider>,
        clients: Arc<dyn ClientProvider>,
        sessions: MapUserSessionProvider,
    }

    fn dyn_clock(clock: &Arc<VirtualClock>) -> Arc<dyn Clock> {
        clock.clone()
    }

    impl Fixture {
        async fn new() -> Self {
            let clock = Arc::new(VirtualClock::starting_at(T0));
            let events: Weak<dyn InvalidationSink> = Weak::<NoopSink>::new();

            let realm_tx = Arc::new(MapTransaction::new(
                Arc::new(ConcurrentHashMapStorage::<RealmEntity>::new(KeyType::Uuid)),
                dyn_clock(&clock),
            ));
            let realms: Arc<dyn RealmProvider> = Arc::new(MapRealmProvider::new(realm_tx, events.clone()));
            let mut realm = realms.create_realm(Some("r"), "r").await.unwrap();
            realm.set_session_settings(
                SessionSettings::default()
                    .with_idle_timeout(60)
                    .with_max_lifespan(3600)
                    .with_offline(600, None),
            );
            realms.update_realm(realm).await.unwrap();

            let client_tx = Arc::new(MapTransaction::new(
                Arc::new(ConcurrentHashMapStorage::<ClientEntity>::new(KeyType::Uuid)),
                dyn_clock(&clock),
            ));
            let clients: Arc<dyn ClientProvider> =
                Arc::new(MapClientProvider::new(client_tx, realms.clone(), events));
            clients.add_client("r", Some("app"), "app").await.unwrap();

            let store = Arc::new(ConcurrentHashMapStorage::new(KeyType::Uuid));
            let tx = Arc::new(MapTransaction::new(
                store.clone() as Arc<dyn MapStorage<UserSessionEntity>>,
                dyn_clock(&clock),
            ));
            let sessions = MapUserSessionProvider::new(tx.clone(), realms.clone(), clients.clone(), dyn_clock(&clock));
            Self {
                clock,
                store,
                tx,
                realms,
                clients,
                sessions,
            }
        }

        /// Commits and continues on a fresh transaction over the same store.
        async fn commit_and_reopen(&mut self) {
            self.tx.commit().await.unwrap();
            self.tx = Arc::new(MapTransaction::new(
                self.store.clone() as Arc<dyn MapStorage<UserSessionEntity>>,
                dyn_clock(&self.clock),
            ));
            self.sessions = MapUserSessionProvider::new(
                self.tx.clone(),
                self.realms.clone(),
                self.clients.clone(),
                dyn_clock(&self.clock),
            );
        }

        async fn stored(&self, id: &str) -> Option<UserSessionEntity> {
            self.store.read(None, id).await.unwrap()
        }

        async fn login(&self, user_id: &str) -> UserSessionEntity {
            self.sessions
                .create_user_session(UserSessionEntity::new("r", user_id, user_id, 0))
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn session_expires_lazily_and_is_deleted_on_read() {
        let mut fx = Fixture::new().await;
        let session = fx.login("alice").await;
        let id = session.id().unwrap().to_string();
        assert_eq!(session.started(), T0);
        assert_eq!(session.expiration(), Some(T0 + 60_000));
        fx.commit_and_reopen().await;

        assert!(fx.sessions.get_user_session("r", &id).await.unwrap().is_some());

        fx.clock.advance(Duration::from_secs(61));
        assert!(fx.sessions.get_user_session("r", &id).await.unwrap().is_none());
        assert!(fx.stored(&id).await.is_some());

        fx.commit_and_reopen().await;
        assert!(fx.stored(&id).await.is_none());
    }

    #[tokio::test]
    async fn refresh_extends_idle_deadline() {
        let fx = Fixture::new().await;
        let id = fx.login("alice").await.id().unwrap().to_string();

        fx.clock.advance(Duration::from_secs(50));
        let refreshed = fx.sessions.refresh_user_session("r", &id).await.unwrap().unwrap();
        assert_eq!(refreshed.expiration(), Some(T0 + 110_000));

        fx.clock.advance(Duration::from_secs(50));
        assert!(fx.sessions.get_user_session("r", &id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let fx = Fixture::new().await;
        let session = UserSessionEntity::new("r", "u1", "alice", 0).with_id("s1").unwrap();
        fx.sessions.create_user_session(session.clone()).await.unwrap();

        let err = fx.sessions.create_user_session(session).await.unwrap_err();
        assert!(matches!(err, SessionError::Storage(ref e) if e.is_duplicate()));
    }

    #[tokio::test]
    async fn unknown_realm_is_reported() {
        let fx = Fixture::new().await;
        let err = fx
            .sessions
            .create_user_session(UserSessionEntity::new("missing", "u1", "alice", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::RealmNotFound(_)));
    }

    #[tokio::test]
    async fn transient_sessions_never_reach_the_backend() {
        let mut fx = Fixture::new().await;
        let session = fx
            .sessions
            .create_user_session(
                UserSessionEntity::new("r", "u1", "alice", 0).with_persistence_state(PersistenceState::Transient),
            )
            .await
            .unwrap();
        let id = session.id().unwrap().to_string();

        fx.sessions.create_client_session("r", &id, "app").await.unwrap();
        let loaded = fx.sessions.get_user_session("r", &id).await.unwrap().unwrap();
        assert!(loaded.client_session("app").is_some());
        assert!(fx.sessions.get_user_session("other", &id).await.unwrap().is_none());

        fx.clock.advance(Duration::from_secs(61));
        assert!(fx.sessions.get_user_session("r", &id).await.unwrap().is_none());

        fx.commit_and_reopen().await;
        assert!(fx.stored(&id).await.is_none());
    }

    #[tokio::test]
    async fn client_sessions_and_counts() {
        let fx = Fixture::new().await;
        let a = fx.login("alice").await.id().unwrap().to_string();
        let b = fx.login("bob").await.id().unwrap().to_string();
        fx.login("carol").await;

        fx.sessions.create_client_session("r", &a, "app").await.unwrap();
        fx.sessions.create_client_session("r", &b, "app").await.unwrap();
        fx.sessions.create_client_session("r", &b, "other").await.unwrap();

        assert_eq!(fx.sessions.get_active_user_sessions("r", "app").await.unwrap(), 2);
        let stats = fx.sessions.get_active_client_session_stats("r", false).await.unwrap();
        assert_eq!(stats.get("app"), Some(&2));
        assert_eq!(stats.get("other"), Some(&1));

        let by_client = fx
            .sessions
            .get_user_sessions_by_client("r", "app", None, Some(1))
            .await
            .unwrap();
        assert_eq!(by_client.len(), 1);

        assert!(fx.sessions.remove_client_session("r", &b, "app").await.unwrap());
        assert!(fx
            .sessions
            .get_client_session("r", &b, "app", false)
            .await
            .unwrap()
            .is_none());
        assert_eq!(fx.sessions.get_active_user_sessions("r", "app").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn client_removal_drops_client_sessions() {
        let fx = Fixture::new().await;
        let a = fx.login("alice").await.id().unwrap().to_string();
        fx.sessions.create_client_session("r", &a, "app").await.unwrap();
        let offline = fx.sessions.create_offline_user_session("r", &a).await.unwrap();
        let offline_id = offline.id().unwrap().to_string();
        let online_cs = fx.sessions.get_client_session("r", &a, "app", false).await.unwrap().unwrap();
        fx.sessions
            .create_offline_client_session("r", &online_cs, &offline_id)
            .await
            .unwrap();

        assert_eq!(fx.sessions.on_client_removed("r", "app").await.unwrap(), 2);
        assert_eq!(fx.sessions.get_active_user_sessions("r", "app").await.unwrap(), 0);
        assert_eq!(fx.sessions.get_offline_sessions_count("r", "app").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn offline_sessions_are_linked_by_notes() {
        let fx = Fixture::new().await;
        fx.clock.advance(Duration::from_secs(10));
        let online = fx.login("alice").await;
        let online_id = online.id().unwrap().to_string();

        fx.clock.advance(Duration::from_secs(5));
        let offline = fx.sessions.create_offline_user_session("r", &online_id).await.unwrap();
        let offline_id = offline.id().unwrap().to_string();
        assert_ne!(offline_id, online_id);
        assert!(offline.is_offline());
        assert_eq!(offline.started(), T0 + 15_000);
        assert_eq!(offline.expiration(), Some(T0 + 615_000));
        assert_eq!(offline.corresponding_session_id(), Some(online_id.as_str()));

        let online = fx.sessions.get_user_session("r", &online_id).await.unwrap().unwrap();
        assert_eq!(online.corresponding_session_id(), Some(offline_id.as_str()));
        assert!(fx.sessions.get_user_session("r", &offline_id).await.unwrap().is_none());

        for key in [&offline_id, &online_id] {
            let found = fx.sessions.get_offline_user_session("r", key).await.unwrap().unwrap();
            assert_eq!(found.id(), Some(offline_id.as_str()));
        }
        assert_eq!(fx.sessions.get_offline_user_sessions("r", "alice").await.unwrap().len(), 1);
        assert_eq!(fx.sessions.get_user_sessions("r", "alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn removing_online_session_keeps_offline_copy() {
        let fx = Fixture::new().await;
        let online_id = fx.login("alice").await.id().unwrap().to_string();
        let offline_id = fx
            .sessions
            .create_offline_user_session("r", &online_id)
            .await
            .unwrap()
            .id()
            .unwrap()
            .to_string();

        assert!(fx.sessions.remove_user_session("r", &online_id).await.unwrap());
        let found = fx.sessions.get_offline_user_session("r", &online_id).await.unwrap();
        assert_eq!(found.unwrap().id(), Some(offline_id.as_str()));
        assert!(!fx.sessions.remove_user_session("r", &offline_id).await.unwrap());
    }

    #[tokio::test]
    async fn removing_offline_session_drops_the_link() {
        let fx = Fixture::new().await;
        let online_id = fx.login("alice").await.id().unwrap().to_string();
        fx.sessions.create_offline_user_session("r", &online_id).await.unwrap();

        assert!(fx.sessions.remove_offline_user_session("r", &online_id).await.unwrap());
        let online = fx.sessions.get_user_session("r", &online_id).await.unwrap().unwrap();
        assert!(online.corresponding_session_id().is_none());
        assert!(fx.sessions.get_offline_user_session("r", &online_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn removal_by_user_covers_online_and_offline() {
        let fx = Fixture::new().await;
        let a = fx.login("alice").await.id().unwrap().to_string();
        fx.sessions.create_offline_user_session("r", &a).await.unwrap();
        fx.login("bob").await;

        assert_eq!(fx.sessions.remove_user_sessions_by_user("r", "alice").await.unwrap(), 2);
        assert!(fx.sessions.get_user_sessions("r", "alice").await.unwrap().is_empty());
        assert_eq!(fx.sessions.get_user_sessions("r", "bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn realm_removal_keeps_offline_sessions_unless_asked() {
        let fx = Fixture::new().await;
        let a = fx.login("alice").await.id().unwrap().to_string();
        fx.sessions.create_offline_user_session("r", &a).await.unwrap();

        assert_eq!(fx.sessions.remove_user_sessions("r").await.unwrap(), 1);
        assert_eq!(fx.sessions.get_offline_user_sessions("r", "alice").await.unwrap().len(), 1);
        assert_eq!(fx.sessions.remove_all_user_sessions("r").await.unwrap(), 1);
        assert!(fx.sessions.get_offline_user_sessions("r", "alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_sessions_no_read_touched() {
        let mut fx = Fixture::new().await;
        let a = fx.login("alice").await.id().unwrap().to_string();
        let b = fx.login("bob").await.id().unwrap().to_string();
        fx.sessions.create_offline_user_session("r", &b).await.unwrap();
        fx.commit_and_reopen().await;

        fx.clock.advance(Duration::from_secs(120));
        // Both online sessions expired; the offline copy has a 600 s idle timeout.
        assert_eq!(fx.sessions.remove_expired("r").await.unwrap(), 2);
        fx.commit_and_reopen().await;
        assert!(fx.stored(&a).await.is_none());
        assert!(fx.stored(&b).await.is_none());
        assert_eq!(fx.store.len(), 1);
    }

    #[tokio::test]
    async fn expired_client_sessions_are_dropped_on_read() {
        let fx = Fixture::new().await;
        let mut client = fx.clients.get_client_by_id("r", "app").await.unwrap().unwrap();
        client.set_single_attribute(kc_model::client::attributes::CLIENT_SESSION_IDLE_TIMEOUT, "10");
        fx.clients.update_client(client).await.unwrap();

        let a = fx.login("alice").await.id().unwrap().to_string();
        let cs = fx.sessions.create_client_session("r", &a, "app").await.unwrap();
        assert_eq!(cs.expiration, Some(T0 + 10_000));

        fx.clock.advance(Duration::from_secs(11));
        let session = fx.sessions.get_user_session("r", &a).await.unwrap().unwrap();
        assert!(session.client_session("app").is_none());
        assert_eq!(fx.sessions.get_active_user_sessions("r", "app").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_client_sessions_are_not_counted_or_matched() {
        let mut fx = Fixture::new().await;
        let mut client = fx.clients.get_client_by_id("r", "app").await.unwrap().unwrap();
        client.set_single_attribute(kc_model::client::attributes::CLIENT_SESSION_IDLE_TIMEOUT, "10");
        fx.clients.update_client(client).await.unwrap();

        let a = fx.login("alice").await.id().unwrap().to_string();
        let b = fx.login("bob").await.id().unwrap().to_string();
        fx.sessions.create_client_session("r", &a, "app").await.unwrap();
        fx.commit_and_reopen().await;

        fx.clock.advance(Duration::from_secs(5));
        fx.sessions.create_client_session("r", &b, "app").await.unwrap();
        fx.commit_and_reopen().await;

        // Only alice's client session has expired; no read has touched it yet.
        fx.clock.advance(Duration::from_secs(6));
        assert_eq!(fx.sessions.get_active_user_sessions("r", "app").await.unwrap(), 1);

        let by_client = fx
            .sessions
            .get_user_sessions_by_client("r", "app", None, None)
            .await
            .unwrap();
        assert_eq!(by_client.len(), 1);
        assert_eq!(by_client[0].id(), Some(b.as_str()));
        assert!(by_client[0].client_session("app").is_some());

        let first_page = fx
            .sessions
            .get_user_sessions_by_client("r", "app", Some(0), Some(1))
            .await
            .unwrap();
        assert_eq!(first_page.len(), 1);
        assert_eq!(first_page[0].id(), Some(b.as_str()));

        fx.commit_and_reopen().await;
        let stored = fx.stored(&a).await.unwrap();
        assert!(stored.client_session("app").is_none());
    }
}
