//! The backend contract.
//!
//! A [`MapStorage`] stores the entities of one type. Implementations live in
//! `kc-storage-map` (in-memory, realm-partitioned) and `kc-storage-sql`
//! (PostgreSQL). Callers never talk to a backend directly; they go through a
//! [`crate::MapTransaction`], which buffers writes until commit.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::stream::BoxStream;
use kc_core::KeyType;
use kc_model::SearchableEntity;
use uuid::Uuid;

use crate::error::StorageResult;
use crate::query::QueryParameters;

/// Lazy result sequence. Dropping it releases backend resources.
pub type EntityStream<E> = BoxStream<'static, StorageResult<E>>;

/// Storage for one entity type.
///
/// Every operation takes the active realm. Realm-partitioned backends route
/// on it and require it to be set; the others ignore it.
#[async_trait]
pub trait MapStorage<E: SearchableEntity>: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Whether the backend keeps one store per realm.
    fn partitioned_by_realm(&self) -> bool {
        false
    }

    /// Generates a fresh id.
    fn new_key(&self) -> String;

    /// Releases what the backend keeps for a removed realm. Returns whether
    /// anything was held.
    fn release_realm(&self, _realm_id: &str) -> bool {
        false
    }

    /// Stores a new entity, which must carry an id. Returns the stored copy.
    ///
    /// ## Errors
    ///
    /// Returns [`crate::StorageError::Duplicate`] if the id is taken.
    async fn create(&self, realm_id: Option<&str>, entity: E) -> StorageResult<E>;

    /// Reads one entity by id.
    ///
    /// ## Errors
    ///
    /// Returns an error if the backend fails.
    async fn read(&self, realm_id: Option<&str>, id: &str) -> StorageResult<Option<E>>;

    /// Reads all matching entities, ordered and paginated per `query`.
    ///
    /// ## Errors
    ///
    /// Returns an error for malformed criteria or a backend failure.
    async fn read_matching(
        &self,
        realm_id: Option<&str>,
        query: &QueryParameters<E::Field>,
    ) -> StorageResult<EntityStream<E>>;

    /// Replaces an existing entity if its version still matches the stored
    /// one. Returns the stored copy, or `None` if the id does not exist.
    ///
    /// ## Errors
    ///
    /// Returns [`crate::StorageError::VersionConflict`] when the stored
    /// version moved, or [`crate::StorageError::LockTimeout`] when the row
    /// lock was not acquired in time.
    async fn update(&self, realm_id: Option<&str>, entity: E) -> StorageResult<Option<E>>;

    /// Deletes one entity. Returns whether it existed.
    ///
    /// ## Errors
    ///
    /// Returns an error if the backend fails.
    async fn delete(&self, realm_id: Option<&str>, id: &str) -> StorageResult<bool>;

    /// Deletes all matching entities, ignoring pagination. Returns the count.
    ///
    /// ## Errors
    ///
    /// Returns an error for malformed criteria or a backend failure.
    async fn delete_matching(
        &self,
        realm_id: Option<&str>,
        query: &QueryParameters<E::Field>,
    ) -> StorageResult<u64>;

    /// Counts matching entities, ignoring pagination.
    ///
    /// ## Errors
    ///
    /// Returns an error for malformed criteria or a backend failure.
    async fn count(&self, realm_id: Option<&str>, query: &QueryParameters<E::Field>) -> StorageResult<u64>;

    /// Whether an entity with `id` exists.
    ///
    /// ## Errors
    ///
    /// Returns an error if the backend fails.
    async fn exists(&self, realm_id: Option<&str>, id: &str) -> StorageResult<bool> {
        Ok(self.read(realm_id, id).await?.is_some())
    }

    /// Whether any entity matches.
    ///
    /// ## Errors
    ///
    /// Returns an error for malformed criteria or a backend failure.
    async fn exists_matching(
        &self,
        realm_id: Option<&str>,
        query: &QueryParameters<E::Field>,
    ) -> StorageResult<bool> {
        Ok(self.count(realm_id, query).await? > 0)
    }

    /// Verifies backend invariants before first use.
    ///
    /// ## Errors
    ///
    /// Returns [`crate::StorageError::ConsistencyViolation`] on mismatch.
    async fn check_consistency(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Id generator shared by the backends.
#[derive(Debug)]
pub enum KeyGenerator {
    /// Time-ordered UUIDs.
    Uuid,
    /// Per-store counter rendered as a decimal string.
    Sequential(AtomicU64),
}

impl KeyGenerator {
    /// Generator for a configured key type.
    #[must_use]
    pub const fn for_type(key_type: KeyType) -> Self {
        match key_type {
            KeyType::Uuid => Self::Uuid,
            KeyType::Sequential => Self::Sequential(AtomicU64::new(0)),
        }
    }

    /// Next key.
    pub fn next_key(&self) -> String {
        match self {
            Self::Uuid => Uuid::now_v7().to_string(),
            Self::Sequential(counter) => (counter.fetch_add(1, Ordering::Relaxed) + 1).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_keys_count_up() {
        let keys = KeyGenerator::for_type(KeyType::Sequential);
        assert_eq!(keys.next_key(), "1");
        assert_eq!(keys.next_key(), "2");
    }

    #[test]
    fn uuid_keys_are_unique() {
        let keys = KeyGenerator::for_type(KeyType::Uuid);
        let a = keys.next_key();
        let b = keys.next_key();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }
}
