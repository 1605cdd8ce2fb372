//! Realm entity.
//!
//! A realm is the tenant boundary: every other entity carries the id of the
//! realm that owns it.

use kc_core::EntityType;
use serde::{Deserialize, Serialize};

use crate::entity::{set_tracked, Entity, EntityMeta};
use crate::searchable::{FieldPath, FieldValue, SearchableEntity, SearchableField, Value};

/// Session timeouts configured on a realm, in seconds.
///
/// Zero or negative disables the corresponding bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Idle timeout of online sessions.
    pub sso_session_idle_timeout: i64,
    /// Absolute lifespan of online sessions.
    pub sso_session_max_lifespan: i64,
    /// Idle timeout of remember-me sessions; falls back to the plain one.
    pub sso_session_idle_timeout_remember_me: i64,
    /// Lifespan of remember-me sessions; falls back to the plain one.
    pub sso_session_max_lifespan_remember_me: i64,
    /// Idle timeout of offline sessions.
    pub offline_session_idle_timeout: i64,
    /// Whether offline sessions have an absolute lifespan.
    pub offline_session_max_lifespan_enabled: bool,
    /// Absolute lifespan of offline sessions.
    pub offline_session_max_lifespan: i64,
    /// Idle timeout of client sessions; falls back to the user session's.
    pub client_session_idle_timeout: i64,
    /// Lifespan of client sessions; falls back to the user session's.
    pub client_session_max_lifespan: i64,
    /// Idle timeout of offline client sessions.
    pub client_offline_session_idle_timeout: i64,
    /// Lifespan of offline client sessions.
    pub client_offline_session_max_lifespan: i64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            sso_session_idle_timeout: 1800,
            sso_session_max_lifespan: 36_000,
            sso_session_idle_timeout_remember_me: 0,
            sso_session_max_lifespan_remember_me: 0,
            offline_session_idle_timeout: 2_592_000,
            offline_session_max_lifespan_enabled: false,
            offline_session_max_lifespan: 5_184_000,
            client_session_idle_timeout: 0,
            client_session_max_lifespan: 0,
            client_offline_session_idle_timeout: 0,
            client_offline_session_max_lifespan: 0,
        }
    }
}

impl SessionSettings {
    /// Sets the online idle timeout.
    #[must_use]
    pub const fn with_idle_timeout(mut self, secs: i64) -> Self {
        self.sso_session_idle_timeout = secs;
        self
    }

    /// Sets the online max lifespan.
    #[must_use]
    pub const fn with_max_lifespan(mut self, secs: i64) -> Self {
        self.sso_session_max_lifespan = secs;
        self
    }

    /// Sets the remember-me timeouts.
    #[must_use]
    pub const fn with_remember_me(mut self, idle_secs: i64, max_secs: i64) -> Self {
        self.sso_session_idle_timeout_remember_me = idle_secs;
        self.sso_session_max_lifespan_remember_me = max_secs;
        self
    }

    /// Sets the offline timeouts; a `max_secs` of `None` disables the lifespan.
    #[must_use]
    pub const fn with_offline(mut self, idle_secs: i64, max_secs: Option<i64>) -> Self {
        self.offline_session_idle_timeout = idle_secs;
        match max_secs {
            Some(max) => {
                self.offline_session_max_lifespan_enabled = true;
                self.offline_session_max_lifespan = max;
            }
            None => self.offline_session_max_lifespan_enabled = false,
        }
        self
    }
}

/// A realm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmEntity {
    #[serde(flatten)]
    meta: EntityMeta,

    // === Identity ===
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    #[serde(default)]
    enabled: bool,

    // === Policies ===
    #[serde(default)]
    duplicate_emails_allowed: bool,
    #[serde(default)]
    sessions: SessionSettings,
}

impl RealmEntity {
    /// Creates an enabled realm with default session settings.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let mut realm = Self {
            name: name.into(),
            enabled: true,
            ..Self::default()
        };
        realm.meta.mark_updated();
        realm
    }

    /// Realm name, unique per store.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the realm.
    pub fn set_name(&mut self, name: impl Into<String>) {
        set_tracked(&mut self.meta, &mut self.name, name.into());
    }

    /// Display name.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Sets the display name.
    pub fn set_display_name(&mut self, display_name: Option<String>) {
        set_tracked(&mut self.meta, &mut self.display_name, display_name);
    }

    /// Whether the realm is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enables or disables the realm.
    pub fn set_enabled(&mut self, enabled: bool) {
        set_tracked(&mut self.meta, &mut self.enabled, enabled);
    }

    /// Whether two users may share an email address.
    #[must_use]
    pub const fn is_duplicate_emails_allowed(&self) -> bool {
        self.duplicate_emails_allowed
    }

    /// Allows or forbids shared email addresses.
    pub fn set_duplicate_emails_allowed(&mut self, allowed: bool) {
        set_tracked(&mut self.meta, &mut self.duplicate_emails_allowed, allowed);
    }

    /// Session timeouts.
    #[must_use]
    pub const fn session_settings(&self) -> &SessionSettings {
        &self.sessions
    }

    /// Replaces the session timeouts.
    pub fn set_session_settings(&mut self, settings: SessionSettings) {
        set_tracked(&mut self.meta, &mut self.sessions, settings);
    }
}

impl Entity for RealmEntity {
    const ENTITY_TYPE: EntityType = EntityType::Realm;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// Searchable realm fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RealmField {
    /// Realm id.
    Id,
    /// Realm name.
    Name,
    /// Attribute; takes the attribute name as key.
    Attribute,
}

impl SearchableField for RealmField {
    fn name(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Name => "name",
            Self::Attribute => "attribute",
        }
    }

    fn key_arity(&self) -> usize {
        usize::from(matches!(self, Self::Attribute))
    }

    fn path(&self) -> FieldPath {
        match self {
            Self::Id => FieldPath::Scalar("id"),
            Self::Name => FieldPath::Scalar("name"),
            Self::Attribute => FieldPath::MultiMap("attributes"),
        }
    }
}

impl SearchableEntity for RealmEntity {
    type Field = RealmField;

    fn field_value(&self, field: RealmField, keys: &[Value]) -> FieldValue {
        match field {
            RealmField::Id => FieldValue::from_opt(self.id()),
            RealmField::Name => FieldValue::from(self.name.as_str()),
            RealmField::Attribute => crate::searchable::attribute_value(self, keys),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_realm_is_enabled_with_default_timeouts() {
        let realm = RealmEntity::new("acme");
        assert!(realm.is_enabled());
        assert!(realm.is_dirty());
        assert_eq!(realm.session_settings().sso_session_idle_timeout, 1800);
        assert!(realm.realm_id().is_none());
    }

    #[test]
    fn offline_lifespan_toggle() {
        let settings = SessionSettings::default().with_offline(600, Some(3600));
        assert!(settings.offline_session_max_lifespan_enabled);
        assert_eq!(settings.offline_session_max_lifespan, 3600);

        let settings = settings.with_offline(600, None);
        assert!(!settings.offline_session_max_lifespan_enabled);
    }
}
