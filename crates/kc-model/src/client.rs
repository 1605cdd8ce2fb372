//! Client entity.

use std::collections::BTreeSet;

use kc_core::EntityType;
use serde::{Deserialize, Serialize};

use crate::entity::{set_tracked, Entity, EntityMeta};
use crate::searchable::{
    attribute_value, FieldPath, FieldValue, SearchableEntity, SearchableField, Value,
};

/// Client attribute names understood by the storage core.
pub mod attributes {
    /// Client session idle timeout override, in seconds.
    pub const CLIENT_SESSION_IDLE_TIMEOUT: &str = "client.session.idle.timeout";
    /// Client session max lifespan override, in seconds.
    pub const CLIENT_SESSION_MAX_LIFESPAN: &str = "client.session.max.lifespan";
    /// Offline client session idle timeout override, in seconds.
    pub const CLIENT_OFFLINE_SESSION_IDLE_TIMEOUT: &str = "client.offline.session.idle.timeout";
    /// Offline client session max lifespan override, in seconds.
    pub const CLIENT_OFFLINE_SESSION_MAX_LIFESPAN: &str = "client.offline.session.max.lifespan";
}

/// An application registered in a realm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEntity {
    #[serde(flatten)]
    meta: EntityMeta,

    // === Identity ===
    client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    protocol: Option<String>,
    #[serde(default)]
    public_client: bool,

    // === Endpoints ===
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    redirect_uris: BTreeSet<String>,

    // === Scope ===
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    scope_mappings: BTreeSet<String>,
}

impl ClientEntity {
    /// Creates an enabled client.
    #[must_use]
    pub fn new(realm_id: &str, client_id: impl Into<String>) -> Self {
        let mut client = Self {
            client_id: client_id.into(),
            enabled: true,
            ..Self::default()
        };
        client.set_realm_id(realm_id);
        client
    }

    /// Public client identifier, unique per realm.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Changes the public client identifier.
    pub fn set_client_id(&mut self, client_id: impl Into<String>) {
        set_tracked(&mut self.meta, &mut self.client_id, client_id.into());
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Sets the display name.
    pub fn set_name(&mut self, name: Option<String>) {
        set_tracked(&mut self.meta, &mut self.name, name);
    }

    /// Whether the client is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enables or disables the client.
    pub fn set_enabled(&mut self, enabled: bool) {
        set_tracked(&mut self.meta, &mut self.enabled, enabled);
    }

    /// Protocol (`openid-connect`, `saml`).
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Sets the protocol.
    pub fn set_protocol(&mut self, protocol: Option<String>) {
        set_tracked(&mut self.meta, &mut self.protocol, protocol);
    }

    /// Whether the client has no secret.
    #[must_use]
    pub const fn is_public_client(&self) -> bool {
        self.public_client
    }

    /// Marks the client public or confidential.
    pub fn set_public_client(&mut self, public: bool) {
        set_tracked(&mut self.meta, &mut self.public_client, public);
    }

    /// Registered redirect URIs.
    #[must_use]
    pub const fn redirect_uris(&self) -> &BTreeSet<String> {
        &self.redirect_uris
    }

    /// Adds a redirect URI.
    pub fn add_redirect_uri(&mut self, uri: impl Into<String>) {
        if self.redirect_uris.insert(uri.into()) {
            self.meta.mark_updated();
        }
    }

    /// Role ids in this client's scope.
    #[must_use]
    pub const fn scope_mappings(&self) -> &BTreeSet<String> {
        &self.scope_mappings
    }

    /// Adds a role to the client's scope.
    pub fn add_scope_mapping(&mut self, role_id: impl Into<String>) {
        if self.scope_mappings.insert(role_id.into()) {
            self.meta.mark_updated();
        }
    }

    /// Removes a role from the client's scope. Returns whether it was present.
    pub fn remove_scope_mapping(&mut self, role_id: &str) -> bool {
        let removed = self.scope_mappings.remove(role_id);
        if removed {
            self.meta.mark_updated();
        }
        removed
    }

    /// Numeric attribute, if set and parseable.
    #[must_use]
    pub fn attribute_secs(&self, name: &str) -> Option<i64> {
        self.first_attribute(name).and_then(|v| v.trim().parse().ok())
    }
}

impl Entity for ClientEntity {
    const ENTITY_TYPE: EntityType = EntityType::Client;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// Searchable client fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientField {
    /// Internal id.
    Id,
    /// Owning realm.
    RealmId,
    /// Public client identifier.
    ClientId,
    /// Enabled flag.
    Enabled,
    /// A role id in the client's scope.
    ScopeMappingRole,
    /// Attribute; takes the attribute name as key.
    Attribute,
}

impl SearchableField for ClientField {
    fn name(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::RealmId => "realm_id",
            Self::ClientId => "client_id",
            Self::Enabled => "enabled",
            Self::ScopeMappingRole => "scope_mapping_role",
            Self::Attribute => "attribute",
        }
    }

    fn key_arity(&self) -> usize {
        usize::from(matches!(self, Self::Attribute))
    }

    fn path(&self) -> FieldPath {
        match self {
            Self::Id => FieldPath::Scalar("id"),
            Self::RealmId => FieldPath::Scalar("realm_id"),
            Self::ClientId => FieldPath::Scalar("client_id"),
            Self::Enabled => FieldPath::Scalar("enabled"),
            Self::ScopeMappingRole => FieldPath::Array("scope_mappings"),
            Self::Attribute => FieldPath::MultiMap("attributes"),
        }
    }
}

impl SearchableEntity for ClientEntity {
    type Field = ClientField;

    fn field_value(&self, field: ClientField, keys: &[Value]) -> FieldValue {
        match field {
            ClientField::Id => FieldValue::from_opt(self.id()),
            ClientField::RealmId => FieldValue::from_opt(self.realm_id()),
            ClientField::ClientId => FieldValue::from(self.client_id.as_str()),
            ClientField::Enabled => FieldValue::from(self.enabled),
            ClientField::ScopeMappingRole => FieldValue::from_strs(&self.scope_mappings),
            ClientField::Attribute => attribute_value(self, keys),
        }
    }
}
