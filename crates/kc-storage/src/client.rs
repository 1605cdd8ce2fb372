//! Client storage provider trait.

use async_trait::async_trait;
use kc_model::ClientEntity;

use crate::error::StorageResult;

/// Provider for client storage operations.
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Creates a client. The internal id is generated when `id` is `None`.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::Duplicate` if the id or the `client_id` is
    /// taken in the realm.
    async fn add_client(&self, realm_id: &str, id: Option<&str>, client_id: &str) -> StorageResult<ClientEntity>;

    /// Gets a client by internal id.
    async fn get_client_by_id(&self, realm_id: &str, id: &str) -> StorageResult<Option<ClientEntity>>;

    /// Gets a client by its public `client_id`.
    async fn get_client_by_client_id(&self, realm_id: &str, client_id: &str) -> StorageResult<Option<ClientEntity>>;

    /// Lists clients ordered by `client_id`.
    async fn get_clients(&self, realm_id: &str, first: Option<i32>, max: Option<i32>) -> StorageResult<Vec<ClientEntity>>;

    /// Case-insensitive substring search on `client_id`.
    async fn search_clients_by_client_id(
        &self,
        realm_id: &str,
        search: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<ClientEntity>>;

    /// Clients carrying every given attribute value.
    async fn search_clients_by_attributes(
        &self,
        realm_id: &str,
        attributes: &[(&str, &str)],
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<ClientEntity>>;

    /// Counts clients in a realm.
    async fn count_clients(&self, realm_id: &str) -> StorageResult<u64>;

    /// Writes back a modified client. Returns `false` if it no longer exists.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::Duplicate` if the `client_id` changed to a taken
    /// one.
    async fn update_client(&self, client: ClientEntity) -> StorageResult<bool>;

    /// Adds a role to the client's scope.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` if the client does not exist.
    async fn add_scope_mapping(&self, realm_id: &str, id: &str, role_id: &str) -> StorageResult<()>;

    /// Removes a role from the client's scope.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` if the client does not exist.
    async fn remove_scope_mapping(&self, realm_id: &str, id: &str, role_id: &str) -> StorageResult<bool>;

    /// Removes a client, firing removal events. Returns `false` if absent.
    ///
    /// ## Errors
    ///
    /// Returns the first failing cascade hook.
    async fn remove_client(&self, realm_id: &str, id: &str) -> StorageResult<bool>;

    /// Removes every client of a realm without per-client events.
    async fn remove_clients(&self, realm_id: &str) -> StorageResult<u64>;

    /// Drops a removed role from every scope mapping. Returns the number of
    /// clients changed.
    async fn remove_role_references(&self, realm_id: &str, role_id: &str) -> StorageResult<u64>;
}
