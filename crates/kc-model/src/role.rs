//! Role entity.
//!
//! Roles are realm-level or client-level. Composite roles reference their
//! members by id; nothing in the store enforces that those ids exist, the
//! role-removal cascade keeps them consistent.

use std::collections::BTreeSet;

use kc_core::EntityType;
use serde::{Deserialize, Serialize};

use crate::entity::{set_tracked, Entity, EntityMeta};
use crate::searchable::{
    attribute_value, FieldPath, FieldValue, SearchableEntity, SearchableField, Value,
};

/// A role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleEntity {
    #[serde(flatten)]
    meta: EntityMeta,

    // === Identity ===
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,

    // === Scope ===
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,

    // === Composite Roles ===
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    composite_roles: BTreeSet<String>,
}

impl RoleEntity {
    /// Creates a realm role.
    #[must_use]
    pub fn new_realm_role(realm_id: &str, name: impl Into<String>) -> Self {
        let mut role = Self {
            name: name.into(),
            ..Self::default()
        };
        role.set_realm_id(realm_id);
        role
    }

    /// Creates a client role.
    #[must_use]
    pub fn new_client_role(realm_id: &str, client_id: &str, name: impl Into<String>) -> Self {
        let mut role = Self::new_realm_role(realm_id, name);
        role.client_id = Some(client_id.to_string());
        role
    }

    /// Role name, unique within its realm or client.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the role.
    pub fn set_name(&mut self, name: impl Into<String>) {
        set_tracked(&mut self.meta, &mut self.name, name.into());
    }

    /// Description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Sets the description.
    pub fn set_description(&mut self, description: Option<String>) {
        set_tracked(&mut self.meta, &mut self.description, description);
    }

    /// Owning client (internal id) for client roles.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Checks if this is a client role.
    #[must_use]
    pub const fn is_client_role(&self) -> bool {
        self.client_id.is_some()
    }

    /// Checks if this is a composite role.
    #[must_use]
    pub fn is_composite(&self) -> bool {
        !self.composite_roles.is_empty()
    }

    /// Ids of member roles.
    #[must_use]
    pub const fn composite_roles(&self) -> &BTreeSet<String> {
        &self.composite_roles
    }

    /// Adds a member role.
    pub fn add_composite_role(&mut self, role_id: impl Into<String>) {
        if self.composite_roles.insert(role_id.into()) {
            self.meta.mark_updated();
        }
    }

    /// Removes a member role. Returns whether it was present.
    pub fn remove_composite_role(&mut self, role_id: &str) -> bool {
        let removed = self.composite_roles.remove(role_id);
        if removed {
            self.meta.mark_updated();
        }
        removed
    }
}

impl Entity for RoleEntity {
    const ENTITY_TYPE: EntityType = EntityType::Role;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// Searchable role fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleField {
    /// Role id.
    Id,
    /// Owning realm.
    RealmId,
    /// Owning client; absent for realm roles.
    ClientId,
    /// Role name.
    Name,
    /// Description.
    Description,
    /// A member role id.
    CompositeRole,
    /// Attribute; takes the attribute name as key.
    Attribute,
}

impl SearchableField for RoleField {
    fn name(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::RealmId => "realm_id",
            Self::ClientId => "client_id",
            Self::Name => "name",
            Self::Description => "description",
            Self::CompositeRole => "composite_role",
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
            Self::Name => FieldPath::Scalar("name"),
            Self::Description => FieldPath::Scalar("description"),
            Self::CompositeRole => FieldPath::Array("composite_roles"),
            Self::Attribute => FieldPath::MultiMap("attributes"),
        }
    }
}

impl SearchableEntity for RoleEntity {
    type Field = RoleField;

    fn field_value(&self, field: RoleField, keys: &[Value]) -> FieldValue {
        match field {
            RoleField::Id => FieldValue::from_opt(self.id()),
            RoleField::RealmId => FieldValue::from_opt(self.realm_id()),
            RoleField::ClientId => FieldValue::from_opt(self.client_id()),
            RoleField::Name => FieldValue::from(self.name.as_str()),
            RoleField::Description => FieldValue::from_opt(self.description()),
            RoleField::CompositeRole => FieldValue::from_strs(&self.composite_roles),
            RoleField::Attribute => attribute_value(self, keys),
        }
    }
}
