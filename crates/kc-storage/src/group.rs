//! Group storage provider trait.

use async_trait::async_trait;
use kc_model::GroupEntity;

use crate::error::StorageResult;

/// Provider for group storage operations.
///
/// Group names are unique among siblings.
#[async_trait]
pub trait GroupProvider: Send + Sync {
    /// Creates a group, top-level when `parent_id` is `None`.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` for an unknown parent and
    /// `StorageError::Duplicate` for a sibling name clash.
    async fn create_group(
        &self,
        realm_id: &str,
        id: Option<&str>,
        name: &str,
        parent_id: Option<&str>,
    ) -> StorageResult<GroupEntity>;

    /// Gets a group by ID.
    async fn get_group_by_id(&self, realm_id: &str, id: &str) -> StorageResult<Option<GroupEntity>>;

    /// Lists all groups ordered by name.
    async fn get_groups(&self, realm_id: &str, first: Option<i32>, max: Option<i32>) -> StorageResult<Vec<GroupEntity>>;

    /// Lists top-level groups ordered by name.
    async fn get_top_level_groups(
        &self,
        realm_id: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<GroupEntity>>;

    /// Lists the direct children of a group ordered by name.
    async fn get_sub_groups(&self, realm_id: &str, parent_id: &str) -> StorageResult<Vec<GroupEntity>>;

    /// Case-insensitive substring search on the group name.
    async fn search_groups_by_name(
        &self,
        realm_id: &str,
        search: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<GroupEntity>>;

    /// Counts groups, optionally only top-level ones.
    async fn count_groups(&self, realm_id: &str, only_top_level: bool) -> StorageResult<u64>;

    /// Writes back a modified group. Returns `false` if it no longer exists.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::Duplicate` if renamed to a sibling's name.
    async fn update_group(&self, group: GroupEntity) -> StorageResult<bool>;

    /// Moves a group under a new parent, or to the top level.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` for unknown groups,
    /// `StorageError::Duplicate` for a name clash under the new parent, and
    /// `StorageError::InvalidData` when moving a group below itself.
    async fn move_group(&self, realm_id: &str, id: &str, new_parent_id: Option<&str>) -> StorageResult<()>;

    /// Grants a role to a group.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` if the group does not exist.
    async fn grant_role(&self, realm_id: &str, id: &str, role_id: &str) -> StorageResult<()>;

    /// Revokes a role from a group.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` if the group does not exist.
    async fn revoke_role(&self, realm_id: &str, id: &str, role_id: &str) -> StorageResult<bool>;

    /// Removes a group and its subgroups, firing removal events for each.
    ///
    /// ## Errors
    ///
    /// Returns the first failing cascade hook.
    async fn remove_group(&self, realm_id: &str, id: &str) -> StorageResult<bool>;

    /// Removes every group of a realm without per-group events.
    async fn remove_groups(&self, realm_id: &str) -> StorageResult<u64>;

    /// Drops a removed role from every group. Returns the number changed.
    async fn remove_role_references(&self, realm_id: &str, role_id: &str) -> StorageResult<u64>;
}
