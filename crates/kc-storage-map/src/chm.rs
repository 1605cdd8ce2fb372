//! Concurrent-map backend.
//!
//! One `DashMap` per entity type, keyed by id. Values are copied on the way
//! in and on the way out, so no caller ever holds the stored instance.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use kc_core::KeyType;
use kc_model::{DeepCloner, SearchableEntity};
use kc_storage::{EntityStream, KeyGenerator, MapStorage, QueryParameters, StorageError, StorageResult};

/// In-process storage for one entity type.
#[derive(Debug)]
pub struct ConcurrentHashMapStorage<E> {
    store: DashMap<String, E>,
    keys: KeyGenerator,
    cloner: DeepCloner,
}

impl<E: SearchableEntity> Default for ConcurrentHashMapStorage<E> {
    fn default() -> Self {
        Self::new(KeyType::Uuid)
    }
}

impl<E: SearchableEntity> ConcurrentHashMapStorage<E> {
    /// Creates an empty store generating keys of `key_type`.
    #[must_use]
    pub fn new(key_type: KeyType) -> Self {
        Self {
            store: DashMap::new(),
            keys: KeyGenerator::for_type(key_type),
            cloner: DeepCloner::new(),
        }
    }

    /// Number of stored entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Copies of every stored entity, in no particular order.
    #[must_use]
    pub fn entities(&self) -> Vec<E> {
        self.store.iter().map(|e| self.cloner.from(e.value())).collect()
    }

    /// Inserts entities as stored state, keeping their versions.
    ///
    /// ## Errors
    ///
    /// Returns [`StorageError::InvalidData`] for an entity without id and
    /// [`StorageError::Duplicate`] for an id already present.
    pub fn load(&self, entities: impl IntoIterator<Item = E>) -> StorageResult<usize> {
        let mut loaded = 0;
        for mut entity in entities {
            let id = entity
                .id()
                .map(str::to_string)
                .ok_or_else(|| StorageError::InvalidData(format!("{} without id", E::ENTITY_TYPE)))?;
            match self.store.entry(id) {
                Entry::Occupied(o) => return Err(StorageError::duplicate_id(E::ENTITY_TYPE, o.key().clone())),
                Entry::Vacant(v) => {
                    entity.clear_dirty();
                    v.insert(entity);
                    loaded += 1;
                }
            }
        }
        Ok(loaded)
    }

    /// Removes every entity.
    pub fn clear(&self) {
        self.store.clear();
    }

    fn select(&self, query: &QueryParameters<E::Field>) -> StorageResult<Vec<E>> {
        query.criteria().validate()?;
        let matching = self
            .store
            .iter()
            .filter(|e| query.criteria().matches_unchecked(e.value()))
            .map(|e| self.cloner.from(e.value()))
            .collect();
        Ok(query.order_and_paginate(matching))
    }
}

#[async_trait]
impl<E: SearchableEntity> MapStorage<E> for ConcurrentHashMapStorage<E> {
    fn name(&self) -> &'static str {
        "concurrent-map"
    }

    fn new_key(&self) -> String {
        self.keys.next_key()
    }

    async fn create(&self, _realm_id: Option<&str>, mut entity: E) -> StorageResult<E> {
        let id = entity
            .id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::InvalidData(format!("{} create without id", E::ENTITY_TYPE)))?;
        match self.store.entry(id) {
            Entry::Occupied(o) => Err(StorageError::duplicate_id(E::ENTITY_TYPE, o.key().clone())),
            Entry::Vacant(v) => {
                entity.clear_dirty();
                v.insert(self.cloner.from(&entity));
                Ok(entity)
            }
        }
    }

    async fn read(&self, _realm_id: Option<&str>, id: &str) -> StorageResult<Option<E>> {
        Ok(self.store.get(id).map(|e| self.cloner.from(e.value())))
    }

    async fn read_matching(
        &self,
        _realm_id: Option<&str>,
        query: &QueryParameters<E::Field>,
    ) -> StorageResult<EntityStream<E>> {
        let selected = self.select(query)?;
        Ok(futures::stream::iter(selected.into_iter().map(Ok)).boxed())
    }

    async fn update(&self, _realm_id: Option<&str>, mut entity: E) -> StorageResult<Option<E>> {
        let Some(id) = entity.id().map(str::to_string) else {
            return Err(StorageError::InvalidData(format!("{} update without id", E::ENTITY_TYPE)));
        };
        let Some(mut current) = self.store.get_mut(&id) else {
            return Ok(None);
        };
        if current.version() != entity.version() {
            return Err(StorageError::VersionConflict {
                entity_type: E::ENTITY_TYPE,
                id,
                expected: entity.version(),
                actual: current.version(),
            });
        }
        let next = entity.version() + 1;
        entity.meta_mut().set_version(next);
        entity.clear_dirty();
        *current = self.cloner.from(&entity);
        Ok(Some(entity))
    }

    async fn delete(&self, _realm_id: Option<&str>, id: &str) -> StorageResult<bool> {
        Ok(self.store.remove(id).is_some())
    }

    async fn delete_matching(
        &self,
        _realm_id: Option<&str>,
        query: &QueryParameters<E::Field>,
    ) -> StorageResult<u64> {
        query.criteria().validate()?;
        let mut removed = 0_u64;
        self.store.retain(|_, e| {
            let matches = query.criteria().matches_unchecked(e);
            if matches {
                removed += 1;
            }
            !matches
        });
        Ok(removed)
    }

    async fn count(&self, _realm_id: Option<&str>, query: &QueryParameters<E::Field>) -> StorageResult<u64> {
        query.criteria().validate()?;
        let count = self
            .store
            .iter()
            .filter(|e| query.criteria().matches_unchecked(e.value()))
            .count();
        Ok(count as u64)
    }

    async fn exists(&self, _realm_id: Option<&str>, id: &str) -> StorageResult<bool> {
        Ok(self.store.contains_key(id))
    }
}
