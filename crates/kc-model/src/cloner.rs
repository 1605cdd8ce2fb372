//! Entity cloning at the storage boundary.
//!
//! Every value handed to or received from a caller passes through the
//! cloner, so callers never hold the instance a backend keeps.

use crate::entity::Entity;

/// Produces fresh or copied entity instances.
///
/// Entities own all their data, which makes a structural clone a deep one;
/// nested collections and owned children are copied along with the parent.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepCloner;

impl DeepCloner {
    /// Creates a cloner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// A zero-valued instance.
    #[must_use]
    pub fn new_instance<E: Entity>(&self) -> E {
        E::default()
    }

    /// A zero-valued instance belonging to a realm.
    #[must_use]
    pub fn new_instance_in_realm<E: Entity>(&self, realm_id: &str) -> E {
        let mut entity = E::default();
        entity.set_realm_id(realm_id);
        entity
    }

    /// A deep copy keeping id, version and dirty state.
    #[must_use]
    pub fn from<E: Entity>(&self, original: &E) -> E {
        original.clone()
    }

    /// A deep copy stored as a new entity: the id is replaced (or cleared so
    /// that the backend generates one) and the version restarts.
    #[must_use]
    pub fn from_with_id<E: Entity>(&self, id: Option<String>, original: &E) -> E {
        let mut copy = original.clone();
        copy.meta_mut().reset_identity(id);
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::RoleEntity;
    use crate::user::UserEntity;
    use crate::credential::CredentialEntity;

    #[test]
    fn new_instance_is_zero_valued() {
        let cloner = DeepCloner::new();
        let role: RoleEntity = cloner.new_instance();
        assert_eq!(role, RoleEntity::default());

        let role: RoleEntity = cloner.new_instance_in_realm("realm-1");
        assert_eq!(role.realm_id(), Some("realm-1"));
        assert!(role.id().is_none());
    }

    #[test]
    fn copies_do_not_alias_nested_collections() {
        let cloner = DeepCloner::new();
        let mut original = UserEntity::new("realm-1", "alice", 0);
        original.add_credential(CredentialEntity::new("c1", "password", "hash", 0));
        original.set_single_attribute("dept", "eng");

        let mut copy = cloner.from(&original);
        copy.credential_mut("c1").unwrap().set_secret_data("changed");
        copy.set_single_attribute("dept", "sales");
        copy.join_group("g1");

        assert_eq!(original.credentials()[0].secret_data, "hash");
        assert_eq!(original.first_attribute("dept"), Some("eng"));
        assert!(original.groups().is_empty());
    }

    #[test]
    fn copy_under_new_id_restarts_version() {
        let cloner = DeepCloner::new();
        let mut original = RoleEntity::new_realm_role("realm-1", "admin");
        original.set_id("r1").unwrap();
        original.meta_mut().set_version(7);
        original.clear_dirty();

        let copy = cloner.from_with_id(Some("r2".to_string()), &original);
        assert_eq!(copy.id(), Some("r2"));
        assert_eq!(copy.version(), 0);
        assert!(copy.is_dirty());
        assert_eq!(copy.name(), original.name());

        let anonymous = cloner.from_with_id(None, &original);
        assert!(anonymous.id().is_none());
    }
}
