//! User session (SSO session) model.

use std::collections::BTreeMap;

use kc_core::EntityType;
use kc_model::{set_tracked, Entity, EntityMeta, FieldPath, FieldValue, SearchableEntity, SearchableField, Value};
use serde::{Deserialize, Serialize};

use crate::client_session::AuthenticatedClientSessionEntity;

/// State of a user session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Session is active and valid.
    #[default]
    LoggedIn,
    /// Logout started but not finished.
    LoggingOut,
    /// Session is logged out but not yet removed.
    LoggedOut,
    /// Logged out via backchannel without confirmation.
    LoggedOutUnconfirmed,
}

/// Where a user session lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistenceState {
    /// Stored in the backend.
    #[default]
    Persistent,
    /// Held only for the current request and never stored.
    Transient,
}

/// Well-known session note keys.
pub mod notes {
    /// Id of the linked online or offline counterpart.
    pub const CORRESPONDING_SESSION_ID: &str = "correspondingSessionId";
    /// The client that initiated the authentication.
    pub const AUTH_CLIENT_ID: &str = "AUTH_CLIENT_ID";
    /// The identity provider alias used.
    pub const IDENTITY_PROVIDER: &str = "IDENTITY_PROVIDER";
}

/// A user session (SSO session).
///
/// Represents an authenticated user's session across multiple clients. Each
/// client the user accessed owns an [`AuthenticatedClientSessionEntity`]
/// inside it, keyed by client id.
///
/// Online and offline sessions share this type; an offline session is an
/// independent copy linked to its online counterpart only through the
/// [`notes::CORRESPONDING_SESSION_ID`] note.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSessionEntity {
    #[serde(flatten)]
    meta: EntityMeta,

    // === Identity ===
    user_id: String,
    #[serde(default)]
    login_username: String,
    #[serde(default)]
    offline: bool,
    #[serde(default)]
    persistence_state: PersistenceState,

    // === Authentication Info ===
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_method: Option<String>,
    #[serde(default)]
    remember_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    broker_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    broker_user_id: Option<String>,

    // === Timestamps ===
    #[serde(default)]
    started: i64,
    #[serde(default)]
    last_session_refresh: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiration: Option<i64>,

    // === State ===
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<SessionState>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    notes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    client_sessions: BTreeMap<String, AuthenticatedClientSessionEntity>,
}

impl UserSessionEntity {
    /// Creates a persistent online session started at `now_millis`.
    #[must_use]
    pub fn new(realm_id: &str, user_id: impl Into<String>, login_username: impl Into<String>, now_millis: i64) -> Self {
        let mut session = Self {
            user_id: user_id.into(),
            login_username: login_username.into(),
            started: now_millis,
            last_session_refresh: now_millis,
            state: Some(SessionState::LoggedIn),
            ..Self::default()
        };
        session.set_realm_id(realm_id);
        session
    }

    /// Sets the id the session is created with.
    ///
    /// ## Errors
    ///
    /// Returns an error for an empty id.
    pub fn with_id(mut self, id: &str) -> kc_model::ModelResult<Self> {
        self.set_id(id)?;
        Ok(self)
    }

    /// Sets the client address.
    #[must_use]
    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    /// Sets the authentication method.
    #[must_use]
    pub fn with_auth_method(mut self, method: impl Into<String>) -> Self {
        self.auth_method = Some(method.into());
        self
    }

    /// Sets the remember me flag.
    #[must_use]
    pub const fn with_remember_me(mut self, remember_me: bool) -> Self {
        self.remember_me = remember_me;
        self
    }

    /// Sets the identity broker session and user ids.
    #[must_use]
    pub fn with_broker(mut self, session_id: Option<String>, user_id: Option<String>) -> Self {
        self.broker_session_id = session_id;
        self.broker_user_id = user_id;
        self
    }

    /// Sets the persistence state.
    #[must_use]
    pub const fn with_persistence_state(mut self, state: PersistenceState) -> Self {
        self.persistence_state = state;
        self
    }

    /// Owning user.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Username typed at login.
    #[must_use]
    pub fn login_username(&self) -> &str {
        &self.login_username
    }

    /// Whether this is an offline session.
    #[must_use]
    pub const fn is_offline(&self) -> bool {
        self.offline
    }

    /// Persistence state.
    #[must_use]
    pub const fn persistence_state(&self) -> PersistenceState {
        self.persistence_state
    }

    /// Client address.
    #[must_use]
    pub fn ip_address(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }

    /// Authentication method.
    #[must_use]
    pub fn auth_method(&self) -> Option<&str> {
        self.auth_method.as_deref()
    }

    /// Whether "remember me" was checked.
    #[must_use]
    pub const fn is_remember_me(&self) -> bool {
        self.remember_me
    }

    /// Broker session id.
    #[must_use]
    pub fn broker_session_id(&self) -> Option<&str> {
        self.broker_session_id.as_deref()
    }

    /// Broker user id.
    #[must_use]
    pub fn broker_user_id(&self) -> Option<&str> {
        self.broker_user_id.as_deref()
    }

    /// Start, epoch millis.
    #[must_use]
    pub const fn started(&self) -> i64 {
        self.started
    }

    /// Last refresh, epoch millis.
    #[must_use]
    pub const fn last_session_refresh(&self) -> i64 {
        self.last_session_refresh
    }

    /// Session state.
    #[must_use]
    pub const fn state(&self) -> Option<SessionState> {
        self.state
    }

    /// Sets the session state.
    pub fn set_state(&mut self, state: SessionState) {
        set_tracked(&mut self.meta, &mut self.state, Some(state));
    }

    /// Restarts both timestamps at `now_millis`.
    pub fn restart(&mut self, now_millis: i64) {
        set_tracked(&mut self.meta, &mut self.started, now_millis);
        set_tracked(&mut self.meta, &mut self.last_session_refresh, now_millis);
    }

    /// Records activity at `now_millis`.
    pub fn set_last_session_refresh(&mut self, now_millis: i64) {
        set_tracked(&mut self.meta, &mut self.last_session_refresh, now_millis);
    }

    /// Sets the expiration.
    pub fn set_expiration(&mut self, expiration: Option<i64>) {
        set_tracked(&mut self.meta, &mut self.expiration, expiration);
    }

    /// Turns this copy into an offline session.
    pub fn set_offline(&mut self, offline: bool) {
        set_tracked(&mut self.meta, &mut self.offline, offline);
    }

    /// Gets a note.
    #[must_use]
    pub fn note(&self, key: &str) -> Option<&str> {
        self.notes.get(key).map(String::as_str)
    }

    /// All notes.
    #[must_use]
    pub const fn notes(&self) -> &BTreeMap<String, String> {
        &self.notes
    }

    /// Sets a note.
    pub fn set_note(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if self.notes.get(&key) != Some(&value) {
            self.notes.insert(key, value);
            self.meta.mark_updated();
        }
    }

    /// Removes a note. Returns whether it was set.
    pub fn remove_note(&mut self, key: &str) -> bool {
        let removed = self.notes.remove(key).is_some();
        if removed {
            self.meta.mark_updated();
        }
        removed
    }

    /// The linked online or offline counterpart.
    #[must_use]
    pub fn corresponding_session_id(&self) -> Option<&str> {
        self.note(notes::CORRESPONDING_SESSION_ID)
    }

    /// Client sessions keyed by client id.
    #[must_use]
    pub const fn client_sessions(&self) -> &BTreeMap<String, AuthenticatedClientSessionEntity> {
        &self.client_sessions
    }

    /// The client session of one client.
    #[must_use]
    pub fn client_session(&self, client_id: &str) -> Option<&AuthenticatedClientSessionEntity> {
        self.client_sessions.get(client_id)
    }

    /// The client session of one client, mutable.
    pub fn client_session_mut(&mut self, client_id: &str) -> Option<&mut AuthenticatedClientSessionEntity> {
        self.client_sessions.get_mut(client_id)
    }

    /// Adds a client session, replacing any previous one of the same client.
    pub fn add_client_session(&mut self, client_session: AuthenticatedClientSessionEntity) {
        self.client_sessions
            .insert(client_session.client_id.clone(), client_session);
        self.meta.mark_updated();
    }

    /// Removes the client session of one client.
    pub fn remove_client_session(&mut self, client_id: &str) -> Option<AuthenticatedClientSessionEntity> {
        let removed = self.client_sessions.remove(client_id);
        if removed.is_some() {
            self.meta.mark_updated();
        }
        removed
    }

    /// Drops every client session expired at `now_millis`. Returns how many.
    pub fn remove_expired_client_sessions(&mut self, now_millis: i64) -> usize {
        let before = self.client_sessions.len();
        self.client_sessions.retain(|_, cs| !cs.is_expired(now_millis));
        let removed = before - self.client_sessions.len();
        if removed > 0 {
            self.meta.mark_updated();
        }
        removed
    }

    /// Drops every client session.
    pub fn clear_client_sessions(&mut self) {
        if !self.client_sessions.is_empty() {
            self.client_sessions.clear();
            self.meta.mark_updated();
        }
    }
}

impl Entity for UserSessionEntity {
    const ENTITY_TYPE: EntityType = EntityType::UserSession;
    const EXPIRABLE: bool = true;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn children_dirty(&self) -> bool {
        self.client_sessions
            .values()
            .any(AuthenticatedClientSessionEntity::is_updated)
    }

    fn clear_children_dirty(&mut self) {
        self.client_sessions
            .values_mut()
            .for_each(AuthenticatedClientSessionEntity::clear_updated);
    }

    fn expiration(&self) -> Option<i64> {
        self.expiration
    }
}

/// Searchable user session fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserSessionField {
    /// Session id.
    Id,
    /// Owning realm.
    RealmId,
    /// Owning user.
    UserId,
    /// Client with a client session in this session.
    ClientId,
    /// Identity broker session id.
    BrokerSessionId,
    /// Identity broker user id.
    BrokerUserId,
    /// Offline flag.
    IsOffline,
    /// Last refresh, epoch millis.
    LastSessionRefresh,
    /// Expiration, epoch millis.
    Expiration,
    /// Session note; takes the note name as key.
    Note,
}

impl SearchableField for UserSessionField {
    fn name(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::RealmId => "realm_id",
            Self::UserId => "user_id",
            Self::ClientId => "client_id",
            Self::BrokerSessionId => "broker_session_id",
            Self::BrokerUserId => "broker_user_id",
            Self::IsOffline => "offline",
            Self::LastSessionRefresh => "last_session_refresh",
            Self::Expiration => "expiration",
            Self::Note => "note",
        }
    }

    fn key_arity(&self) -> usize {
        usize::from(matches!(self, Self::Note))
    }

    fn path(&self) -> FieldPath {
        match self {
            Self::Id => FieldPath::Scalar("id"),
            Self::RealmId => FieldPath::Scalar("realm_id"),
            Self::UserId => FieldPath::Scalar("user_id"),
            Self::ClientId => FieldPath::MapKeys("client_sessions"),
            Self::BrokerSessionId => FieldPath::Scalar("broker_session_id"),
            Self::BrokerUserId => FieldPath::Scalar("broker_user_id"),
            Self::IsOffline => FieldPath::Scalar("offline"),
            Self::LastSessionRefresh => FieldPath::Scalar("last_session_refresh"),
            Self::Expiration => FieldPath::Scalar("expiration"),
            Self::Note => FieldPath::Map("notes"),
        }
    }
}

impl SearchableEntity for UserSessionEntity {
    type Field = UserSessionField;

    fn field_value(&self, field: UserSessionField, keys: &[Value]) -> FieldValue {
        match field {
            UserSessionField::Id => FieldValue::from_opt(self.id()),
            UserSessionField::RealmId => FieldValue::from_opt(self.realm_id()),
            UserSessionField::UserId => FieldValue::from(self.user_id.as_str()),
            UserSessionField::ClientId => FieldValue::from_strs(self.client_sessions.keys()),
            UserSessionField::BrokerSessionId => FieldValue::from_opt(self.broker_session_id()),
            UserSessionField::BrokerUserId => FieldValue::from_opt(self.broker_user_id()),
            UserSessionField::IsOffline => FieldValue::from(self.offline),
            UserSessionField::LastSessionRefresh => FieldValue::from(self.last_session_refresh),
            UserSessionField::Expiration => self.expiration.map_or(FieldValue::Absent, FieldValue::from),
            UserSessionField::Note => keys
                .first()
                .and_then(Value::as_str)
                .map_or(FieldValue::Absent, |key| FieldValue::from_opt(self.note(key))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> UserSessionEntity {
        UserSessionEntity::new("realm-1", "user-1", "alice", 10_000)
    }

    #[test]
    fn new_session_is_logged_in_and_persistent() {
        let s = session();
        assert_eq!(s.state(), Some(SessionState::LoggedIn));
        assert_eq!(s.persistence_state(), PersistenceState::Persistent);
        assert_eq!(s.started(), 10_000);
        assert_eq!(s.last_session_refresh(), 10_000);
        assert!(!s.is_offline());
        assert_eq!(s.realm_id(), Some("realm-1"));
    }

    #[test]
    fn client_session_changes_mark_the_parent_dirty() {
        let mut s = session();
        s.add_client_session(AuthenticatedClientSessionEntity::new("cs1", "app", 10_000));
        s.clear_dirty();
        assert!(!s.is_dirty());

        s.client_session_mut("app").unwrap().set_note("scope", "openid");
        assert!(s.is_dirty());
        assert!(!s.meta().is_updated());
    }

    #[test]
    fn expired_client_sessions_are_dropped() {
        let mut s = session();
        let mut short = AuthenticatedClientSessionEntity::new("cs1", "short", 10_000);
        short.set_expiration(Some(20_000));
        s.add_client_session(short);
        s.add_client_session(AuthenticatedClientSessionEntity::new("cs2", "long", 10_000));
        s.clear_dirty();

        assert_eq!(s.remove_expired_client_sessions(19_999), 0);
        assert!(!s.is_dirty());
        assert_eq!(s.remove_expired_client_sessions(20_000), 1);
        assert!(s.client_session("short").is_none());
        assert!(s.client_session("long").is_some());
    }

    #[test]
    fn searchable_fields() {
        let mut s = session();
        s.set_note(notes::CORRESPONDING_SESSION_ID, "offline-1");
        s.add_client_session(AuthenticatedClientSessionEntity::new("cs1", "app", 10_000));

        let key = [Value::from(notes::CORRESPONDING_SESSION_ID)];
        assert_eq!(
            s.field_value(UserSessionField::Note, &key),
            FieldValue::from("offline-1")
        );
        assert_eq!(
            s.field_value(UserSessionField::ClientId, &[]),
            FieldValue::Many(vec![Value::from("app")])
        );
        assert_eq!(s.field_value(UserSessionField::Expiration, &[]), FieldValue::Absent);
        assert_eq!(s.field_value(UserSessionField::IsOffline, &[]), FieldValue::from(false));
    }

    #[test]
    fn serialized_form_matches_field_paths() {
        let mut s = session();
        s.set_expiration(Some(99));
        s.add_client_session(AuthenticatedClientSessionEntity::new("cs1", "app", 10_000));
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["user_id"], "user-1");
        assert_eq!(json["expiration"], 99);
        assert!(json["client_sessions"]["app"].is_object());

        let back: UserSessionEntity = serde_json::from_value(json).unwrap();
        assert_eq!(back, s);
    }
}
