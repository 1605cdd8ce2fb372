//! Group entity.
//!
//! Groups form a tree through `parent_id`; a group without parent is a
//! top-level group.

use std::collections::BTreeSet;

use kc_core::EntityType;
use serde::{Deserialize, Serialize};

use crate::entity::{set_tracked, Entity, EntityMeta};
use crate::searchable::{
    attribute_value, FieldPath, FieldValue, SearchableEntity, SearchableField, Value,
};

/// A group of users.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntity {
    #[serde(flatten)]
    meta: EntityMeta,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    granted_roles: BTreeSet<String>,
}

impl GroupEntity {
    /// Creates a group; `parent_id` of `None` makes it top-level.
    #[must_use]
    pub fn new(realm_id: &str, name: impl Into<String>, parent_id: Option<String>) -> Self {
        let mut group = Self {
            name: name.into(),
            parent_id,
            ..Self::default()
        };
        group.set_realm_id(realm_id);
        group
    }

    /// Group name, unique among siblings.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the group.
    pub fn set_name(&mut self, name: impl Into<String>) {
        set_tracked(&mut self.meta, &mut self.name, name.into());
    }

    /// Parent group id.
    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// Moves the group under another parent, or to the top level.
    pub fn set_parent_id(&mut self, parent_id: Option<String>) {
        set_tracked(&mut self.meta, &mut self.parent_id, parent_id);
    }

    /// Role ids granted to members.
    #[must_use]
    pub const fn granted_roles(&self) -> &BTreeSet<String> {
        &self.granted_roles
    }

    /// Grants a role to members.
    pub fn grant_role(&mut self, role_id: impl Into<String>) {
        if self.granted_roles.insert(role_id.into()) {
            self.meta.mark_updated();
        }
    }

    /// Revokes a role. Returns whether it was granted.
    pub fn revoke_role(&mut self, role_id: &str) -> bool {
        let removed = self.granted_roles.remove(role_id);
        if removed {
            self.meta.mark_updated();
        }
        removed
    }
}

impl Entity for GroupEntity {
    const ENTITY_TYPE: EntityType = EntityType::Group;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// Searchable group fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupField {
    /// Group id.
    Id,
    /// Owning realm.
    RealmId,
    /// Group name.
    Name,
    /// Parent group id; absent for top-level groups.
    ParentId,
    /// A granted role id.
    AssignedRole,
    /// Attribute; takes the attribute name as key.
    Attribute,
}

impl SearchableField for GroupField {
    fn name(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::RealmId => "realm_id",
            Self::Name => "name",
            Self::ParentId => "parent_id",
            Self::AssignedRole => "assigned_role",
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
            Self::Name => FieldPath::Scalar("name"),
            Self::ParentId => FieldPath::Scalar("parent_id"),
            Self::AssignedRole => FieldPath::Array("granted_roles"),
            Self::Attribute => FieldPath::MultiMap("attributes"),
        }
    }
}

impl SearchableEntity for GroupEntity {
    type Field = GroupField;

    fn field_value(&self, field: GroupField, keys: &[Value]) -> FieldValue {
        match field {
            GroupField::Id => FieldValue::from_opt(self.id()),
            GroupField::RealmId => FieldValue::from_opt(self.realm_id()),
            GroupField::Name => FieldValue::from(self.name.as_str()),
            GroupField::ParentId => FieldValue::from_opt(self.parent_id()),
            GroupField::AssignedRole => FieldValue::from_strs(&self.granted_roles),
            GroupField::Attribute => attribute_value(self, keys),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_group_has_absent_parent() {
        let group = GroupEntity::new("realm-1", "staff", None);
        assert_eq!(group.field_value(GroupField::ParentId, &[]), FieldValue::Absent);

        let child = GroupEntity::new("realm-1", "interns", Some("g1".to_string()));
        assert_eq!(child.field_value(GroupField::ParentId, &[]), FieldValue::from("g1"));
    }
}
