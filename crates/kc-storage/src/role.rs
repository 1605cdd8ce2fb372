//! Role storage provider trait.

use async_trait::async_trait;
use kc_model::RoleEntity;

use crate::error::StorageResult;

/// Provider for role storage operations.
///
/// Realm role names are unique in the realm, client role names in the
/// client.
#[async_trait]
pub trait RoleProvider: Send + Sync {
    /// Creates a realm role.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::Duplicate` if the id or name is taken.
    async fn add_realm_role(&self, realm_id: &str, id: Option<&str>, name: &str) -> StorageResult<RoleEntity>;

    /// Creates a client role.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::Duplicate` if the id or name is taken.
    async fn add_client_role(
        &self,
        realm_id: &str,
        client_id: &str,
        id: Option<&str>,
        name: &str,
    ) -> StorageResult<RoleEntity>;

    /// Gets a role by ID.
    async fn get_role_by_id(&self, realm_id: &str, id: &str) -> StorageResult<Option<RoleEntity>>;

    /// Gets a realm role by name.
    async fn get_realm_role(&self, realm_id: &str, name: &str) -> StorageResult<Option<RoleEntity>>;

    /// Gets a client role by name.
    async fn get_client_role(&self, realm_id: &str, client_id: &str, name: &str) -> StorageResult<Option<RoleEntity>>;

    /// Lists realm roles ordered by name.
    async fn get_realm_roles(&self, realm_id: &str, first: Option<i32>, max: Option<i32>) -> StorageResult<Vec<RoleEntity>>;

    /// Lists the roles of one client ordered by name.
    async fn get_client_roles(
        &self,
        realm_id: &str,
        client_id: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<RoleEntity>>;

    /// Case-insensitive substring search on name and description.
    async fn search_for_roles(
        &self,
        realm_id: &str,
        search: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<RoleEntity>>;

    /// Writes back a modified role. Returns `false` if it no longer exists.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::Duplicate` if renamed to a taken name.
    async fn update_role(&self, role: RoleEntity) -> StorageResult<bool>;

    /// Makes `member_id` part of the composite role `id`.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` if the role does not exist.
    async fn add_composite(&self, realm_id: &str, id: &str, member_id: &str) -> StorageResult<()>;

    /// Removes `member_id` from the composite role `id`.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` if the role does not exist.
    async fn remove_composite(&self, realm_id: &str, id: &str, member_id: &str) -> StorageResult<bool>;

    /// Removes a role, firing removal events. Returns `false` if absent.
    ///
    /// ## Errors
    ///
    /// Returns the first failing cascade hook.
    async fn remove_role(&self, realm_id: &str, id: &str) -> StorageResult<bool>;

    /// Removes every role of a client, firing events for each.
    ///
    /// ## Errors
    ///
    /// Returns the first failing cascade hook.
    async fn remove_client_roles(&self, realm_id: &str, client_id: &str) -> StorageResult<u64>;

    /// Removes every role of a realm without per-role events.
    async fn remove_roles(&self, realm_id: &str) -> StorageResult<u64>;

    /// Drops a removed role from every composite. Returns the number changed.
    async fn remove_role_references(&self, realm_id: &str, role_id: &str) -> StorageResult<u64>;
}
