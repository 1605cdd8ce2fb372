//! Session provider trait.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::client_session::AuthenticatedClientSessionEntity;
use crate::error::SessionResult;
use crate::user_session::UserSessionEntity;

/// Provider for user, client and offline sessions.
///
/// Every read applies lazy expiry: an expired session is reported absent and
/// its removal is buffered as a side effect. Expired client sessions are
/// dropped from the user session that is returned.
#[async_trait]
pub trait UserSessionProvider: Send + Sync {
    // === User Session Operations ===

    /// Creates a user session.
    ///
    /// Timestamps restart at the current time and the expiration is derived
    /// from the realm. A transient session lives only in this provider.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::Duplicate` if the id is taken, or
    /// [`SessionError::RealmNotFound`](crate::SessionError::RealmNotFound).
    async fn create_user_session(&self, session: UserSessionEntity) -> SessionResult<UserSessionEntity>;

    /// Gets an online user session by ID.
    async fn get_user_session(&self, realm_id: &str, id: &str) -> SessionResult<Option<UserSessionEntity>>;

    /// Writes back a modified user session. Returns `false` if it is gone.
    async fn update_user_session(&self, session: UserSessionEntity) -> SessionResult<bool>;

    /// Records activity now, extending the idle deadline.
    async fn refresh_user_session(&self, realm_id: &str, id: &str) -> SessionResult<Option<UserSessionEntity>>;

    /// Online sessions of one user.
    async fn get_user_sessions(&self, realm_id: &str, user_id: &str) -> SessionResult<Vec<UserSessionEntity>>;

    /// Online sessions holding a client session for `client_id`, least
    /// recently refreshed first.
    async fn get_user_sessions_by_client(
        &self,
        realm_id: &str,
        client_id: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> SessionResult<Vec<UserSessionEntity>>;

    /// Online session created through an identity broker session.
    async fn get_user_session_by_broker_session_id(
        &self,
        realm_id: &str,
        broker_session_id: &str,
    ) -> SessionResult<Option<UserSessionEntity>>;

    /// Online sessions of one brokered user.
    async fn get_user_sessions_by_broker_user_id(
        &self,
        realm_id: &str,
        broker_user_id: &str,
    ) -> SessionResult<Vec<UserSessionEntity>>;

    /// Counts online sessions holding a client session for `client_id`.
    async fn get_active_user_sessions(&self, realm_id: &str, client_id: &str) -> SessionResult<u64>;

    /// Number of sessions per client id.
    async fn get_active_client_session_stats(
        &self,
        realm_id: &str,
        offline: bool,
    ) -> SessionResult<BTreeMap<String, u64>>;

    /// Removes one online session. Its offline counterpart stays.
    async fn remove_user_session(&self, realm_id: &str, id: &str) -> SessionResult<bool>;

    /// Removes every online and offline session of a user.
    async fn remove_user_sessions_by_user(&self, realm_id: &str, user_id: &str) -> SessionResult<u64>;

    /// Removes every online session of a realm.
    async fn remove_user_sessions(&self, realm_id: &str) -> SessionResult<u64>;

    /// Removes every online and offline session of a realm.
    async fn remove_all_user_sessions(&self, realm_id: &str) -> SessionResult<u64>;

    /// Removes every expired session of a realm, including ones no read
    /// has touched. Returns how many.
    async fn remove_expired(&self, realm_id: &str) -> SessionResult<u64>;

    // === Client Session Operations ===

    /// Creates the client session of `client_id` in an online or offline
    /// user session, replacing any previous one.
    ///
    /// ## Errors
    ///
    /// Returns [`SessionError::NotFound`](crate::SessionError::NotFound) if
    /// the user session does not exist.
    async fn create_client_session(
        &self,
        realm_id: &str,
        user_session_id: &str,
        client_id: &str,
    ) -> SessionResult<AuthenticatedClientSessionEntity>;

    /// Gets the client session of `client_id`.
    async fn get_client_session(
        &self,
        realm_id: &str,
        user_session_id: &str,
        client_id: &str,
        offline: bool,
    ) -> SessionResult<Option<AuthenticatedClientSessionEntity>>;

    /// Removes the client session of `client_id`.
    async fn remove_client_session(
        &self,
        realm_id: &str,
        user_session_id: &str,
        client_id: &str,
    ) -> SessionResult<bool>;

    /// Drops the client sessions of a removed client from every online and
    /// offline session. Returns the number of sessions changed.
    async fn on_client_removed(&self, realm_id: &str, client_id: &str) -> SessionResult<u64>;

    // === Offline Session Operations ===

    /// Creates the offline copy of an online session.
    ///
    /// The copy gets a new id and fresh timestamps, no client sessions, and a
    /// note pointing back to the online session; the online session gets a
    /// note pointing to the copy.
    ///
    /// ## Errors
    ///
    /// Returns [`SessionError::NotFound`](crate::SessionError::NotFound) if
    /// the online session does not exist.
    async fn create_offline_user_session(&self, realm_id: &str, online_id: &str) -> SessionResult<UserSessionEntity>;

    /// Gets an offline session by its own id, by the id of its online
    /// counterpart, or by reverse lookup of the link note.
    async fn get_offline_user_session(&self, realm_id: &str, id: &str) -> SessionResult<Option<UserSessionEntity>>;

    /// Offline sessions of one user.
    async fn get_offline_user_sessions(&self, realm_id: &str, user_id: &str)
        -> SessionResult<Vec<UserSessionEntity>>;

    /// Offline session created through an identity broker session.
    async fn get_offline_user_session_by_broker_session_id(
        &self,
        realm_id: &str,
        broker_session_id: &str,
    ) -> SessionResult<Option<UserSessionEntity>>;

    /// Offline sessions holding a client session for `client_id`.
    async fn get_offline_user_sessions_by_client(
        &self,
        realm_id: &str,
        client_id: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> SessionResult<Vec<UserSessionEntity>>;

    /// Copies an online client session into an offline session.
    ///
    /// ## Errors
    ///
    /// Returns [`SessionError::NotFound`](crate::SessionError::NotFound) if
    /// the offline session does not exist.
    async fn create_offline_client_session(
        &self,
        realm_id: &str,
        client_session: &AuthenticatedClientSessionEntity,
        offline_session_id: &str,
    ) -> SessionResult<AuthenticatedClientSessionEntity>;

    /// Removes an offline session, given its own id or its online
    /// counterpart's, and drops the link note from the online session.
    async fn remove_offline_user_session(&self, realm_id: &str, id: &str) -> SessionResult<bool>;

    /// Counts offline sessions holding a client session for `client_id`.
    async fn get_offline_sessions_count(&self, realm_id: &str, client_id: &str) -> SessionResult<u64>;
}
