//! Realm-partitioned backend.
//!
//! One [`ConcurrentHashMapStorage`] per realm. Every operation is routed by
//! the realm id passed in by the transaction; without one it fails with
//! [`StorageError::RealmNotSet`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use kc_core::KeyType;
use kc_model::SearchableEntity;
use kc_storage::{EntityStream, KeyGenerator, MapStorage, QueryParameters, StorageError, StorageResult};

use crate::chm::ConcurrentHashMapStorage;

/// Storage keeping a separate container per realm.
#[derive(Debug)]
pub struct RealmPartitionedStorage<E> {
    partitions: DashMap<String, Arc<ConcurrentHashMapStorage<E>>>,
    key_type: KeyType,
    keys: KeyGenerator,
}

impl<E: SearchableEntity> RealmPartitionedStorage<E> {
    /// Creates a store generating keys of `key_type`.
    #[must_use]
    pub fn new(key_type: KeyType) -> Self {
        Self {
            partitions: DashMap::new(),
            key_type,
            keys: KeyGenerator::for_type(key_type),
        }
    }

    /// Realms that currently have a container.
    #[must_use]
    pub fn realms(&self) -> Vec<String> {
        self.partitions.iter().map(|p| p.key().clone()).collect()
    }

    /// The container of one realm, if created.
    #[must_use]
    pub fn partition(&self, realm_id: &str) -> Option<Arc<ConcurrentHashMapStorage<E>>> {
        self.partitions.get(realm_id).map(|p| Arc::clone(p.value()))
    }

    /// Drops the container of a realm. Returns whether it existed.
    pub fn drop_partition(&self, realm_id: &str) -> bool {
        let removed = self.partitions.remove(realm_id).is_some();
        if removed {
            tracing::debug!(realm_id, entity_type = %E::ENTITY_TYPE, "Dropped realm partition");
        }
        removed
    }

    fn existing(&self, realm_id: Option<&str>) -> StorageResult<Option<Arc<ConcurrentHashMapStorage<E>>>> {
        let realm_id = realm_id.ok_or(StorageError::RealmNotSet(E::ENTITY_TYPE))?;
        Ok(self.partition(realm_id))
    }

    fn create_or_get(&self, realm_id: Option<&str>) -> StorageResult<Arc<ConcurrentHashMapStorage<E>>> {
        let realm_id = realm_id.ok_or(StorageError::RealmNotSet(E::ENTITY_TYPE))?;
        let partition = self
            .partitions
            .entry(realm_id.to_string())
            .or_insert_with(|| Arc::new(ConcurrentHashMapStorage::new(self.key_type)));
        Ok(Arc::clone(partition.value()))
    }
}

#[async_trait]
impl<E: SearchableEntity> MapStorage<E> for RealmPartitionedStorage<E> {
    fn name(&self) -> &'static str {
        "realm-partitioned"
    }

    fn partitioned_by_realm(&self) -> bool {
        true
    }

    fn new_key(&self) -> String {
        self.keys.next_key()
    }

    fn release_realm(&self, realm_id: &str) -> bool {
        self.drop_partition(realm_id)
    }

    async fn create(&self, realm_id: Option<&str>, entity: E) -> StorageResult<E> {
        self.create_or_get(realm_id)?.create(realm_id, entity).await
    }

    async fn read(&self, realm_id: Option<&str>, id: &str) -> StorageResult<Option<E>> {
        match self.existing(realm_id)? {
            Some(partition) => partition.read(realm_id, id).await,
            None => Ok(None),
        }
    }

    async fn read_matching(
        &self,
        realm_id: Option<&str>,
        query: &QueryParameters<E::Field>,
    ) -> StorageResult<EntityStream<E>> {
        match self.existing(realm_id)? {
            Some(partition) => partition.read_matching(realm_id, query).await,
            None => {
                query.criteria().validate()?;
                Ok(futures::stream::empty().boxed())
            }
        }
    }

    async fn update(&self, realm_id: Option<&str>, entity: E) -> StorageResult<Option<E>> {
        match self.existing(realm_id)? {
            Some(partition) => partition.update(realm_id, entity).await,
            None => Ok(None),
        }
    }

    async fn delete(&self, realm_id: Option<&str>, id: &str) -> StorageResult<bool> {
        match self.existing(realm_id)? {
            Some(partition) => partition.delete(realm_id, id).await,
            None => Ok(false),
        }
    }

    async fn delete_matching(
        &self,
        realm_id: Option<&str>,
        query: &QueryParameters<E::Field>,
    ) -> StorageResult<u64> {
        match self.existing(realm_id)? {
            Some(partition) => partition.delete_matching(realm_id, query).await,
            None => Ok(0),
        }
    }

    async fn count(&self, realm_id: Option<&str>, query: &QueryParameters<E::Field>) -> StorageResult<u64> {
        match self.existing(realm_id)? {
            Some(partition) => partition.count(realm_id, query).await,
            None => Ok(0),
        }
    }
}
