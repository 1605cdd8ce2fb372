//! Realm storage provider trait.

use async_trait::async_trait;
use kc_model::RealmEntity;

use crate::error::StorageResult;

/// Provider for realm storage operations.
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait RealmProvider: Send + Sync {
    /// Creates a new realm. The id is generated when `id` is `None`.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::Duplicate` if the id or name is taken.
    async fn create_realm(&self, id: Option<&str>, name: &str) -> StorageResult<RealmEntity>;

    /// Gets a realm by ID.
    async fn get_realm(&self, id: &str) -> StorageResult<Option<RealmEntity>>;

    /// Gets a realm by name.
    async fn get_realm_by_name(&self, name: &str) -> StorageResult<Option<RealmEntity>>;

    /// Lists realms ordered by name.
    async fn get_realms(&self, first: Option<i32>, max: Option<i32>) -> StorageResult<Vec<RealmEntity>>;

    /// Lists realms carrying an attribute value.
    async fn get_realms_with_attribute(&self, name: &str, value: &str) -> StorageResult<Vec<RealmEntity>>;

    /// Counts all realms.
    async fn count_realms(&self) -> StorageResult<u64>;

    /// Writes back a modified realm. Returns `false` if it no longer exists.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::Duplicate` if renamed to a taken name.
    async fn update_realm(&self, realm: RealmEntity) -> StorageResult<bool>;

    /// Removes a realm and everything it contains. Returns `false` if the
    /// realm did not exist.
    ///
    /// ## Errors
    ///
    /// Returns the first failing cascade hook.
    async fn remove_realm(&self, id: &str) -> StorageResult<bool>;
}
