//! Buffered per-session access to one backend.
//!
//! A [`MapTransaction`] records creates, updates and deletes in memory and
//! applies them to the backend, in the order they were issued, on commit.
//! Reads merge the buffered changes over the stored state, so a session always
//! sees its own writes. Expired entities are hidden on read and their deletion
//! is buffered like any other delete.
//!
//! The state lock is never held across an await.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kc_core::Clock;
use kc_model::{DeepCloner, SearchableEntity};
use parking_lot::Mutex;

use crate::backend::{EntityStream, MapStorage};
use crate::error::{StorageError, StorageResult};
use crate::manager::StorageTransaction;
use crate::query::QueryParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    NotStarted,
    Active,
    Committed,
    RolledBack,
}

enum OpKind<F> {
    Create(String),
    Update(String),
    Delete(String),
    DeleteMatching(QueryParameters<F>),
}

struct Op<F> {
    scope: Option<String>,
    kind: OpKind<F>,
}

impl<F> Op<F> {
    fn is_single(&self, scope: &Option<String>, id: &str, create: bool) -> bool {
        if self.scope != *scope {
            return false;
        }
        match &self.kind {
            OpKind::Create(op_id) => create && op_id == id,
            OpKind::Update(op_id) => !create && op_id == id,
            _ => false,
        }
    }

    fn is_delete_of(&self, scope: &Option<String>, id: &str) -> bool {
        self.scope == *scope && matches!(&self.kind, OpKind::Delete(op_id) if op_id == id)
    }
}

enum Pending<E> {
    Created(E),
    Updated(E),
    Deleted,
}

type PendingKey = (Option<String>, String);

enum Local<E> {
    Present(E),
    Removed,
    Unknown,
}

struct TxState<E: SearchableEntity> {
    status: Status,
    rollback_only: bool,
    realm_id: Option<String>,
    ops: Vec<Op<E::Field>>,
    pending: HashMap<PendingKey, Pending<E>>,
}

impl<E: SearchableEntity> TxState<E> {
    fn ensure_usable(&self) -> StorageResult<()> {
        match self.status {
            Status::NotStarted | Status::Active => Ok(()),
            Status::Committed | Status::RolledBack => Err(StorageError::Transaction(format!(
                "{} transaction already completed",
                E::ENTITY_TYPE
            ))),
        }
    }

    fn local(&self, scope: &Option<String>, id: &str) -> Local<E> {
        match self.pending.get(&(scope.clone(), id.to_string())) {
            Some(Pending::Created(e) | Pending::Updated(e)) => Local::Present(e.clone()),
            Some(Pending::Deleted) => Local::Removed,
            None => Local::Unknown,
        }
    }

    fn has_bulk_delete(&self, scope: &Option<String>) -> bool {
        self.ops
            .iter()
            .any(|op| op.scope == *scope && matches!(op.kind, OpKind::DeleteMatching(_)))
    }

    fn hidden_by_bulk(&self, scope: &Option<String>, entity: &E) -> bool {
        self.ops.iter().any(|op| {
            op.scope == *scope
                && matches!(&op.kind, OpKind::DeleteMatching(q) if q.criteria().matches_unchecked(entity))
        })
    }

    /// Buffers the deletion of `id`. `stored` says whether the backend holds
    /// the entity when nothing is pending for it.
    fn mark_deleted(&mut self, scope: &Option<String>, id: &str, stored: bool) -> bool {
        let key = (scope.clone(), id.to_string());
        match self.pending.get(&key) {
            Some(Pending::Created(_)) => {
                self.ops.retain(|op| !op.is_single(scope, id, true));
                if self.ops.iter().any(|op| op.is_delete_of(scope, id)) {
                    self.pending.insert(key, Pending::Deleted);
                } else {
                    self.pending.remove(&key);
                }
                true
            }
            Some(Pending::Updated(_)) => {
                self.ops.retain(|op| !op.is_single(scope, id, false));
                self.push_delete(key);
                true
            }
            Some(Pending::Deleted) => false,
            None if stored => {
                self.push_delete(key);
                true
            }
            None => false,
        }
    }

    fn push_delete(&mut self, key: PendingKey) {
        self.ops.push(Op {
            scope: key.0.clone(),
            kind: OpKind::Delete(key.1.clone()),
        });
        self.pending.insert(key, Pending::Deleted);
    }

    /// Whether a stored entity is visible to this transaction. Expired ones
    /// are deleted on the way.
    fn admit_stored(&mut self, scope: &Option<String>, entity: &E, now_millis: i64) -> bool {
        let Some(id) = entity.id() else {
            return false;
        };
        if self.pending.contains_key(&(scope.clone(), id.to_string())) || self.hidden_by_bulk(scope, entity) {
            return false;
        }
        if E::EXPIRABLE && entity.is_expired(now_millis) {
            tracing::debug!(entity_type = %E::ENTITY_TYPE, id, "Removing expired entity");
            let id = id.to_string();
            self.mark_deleted(scope, &id, true);
            return false;
        }
        true
    }

    fn is_clean(&self) -> bool {
        self.ops.is_empty() && self.pending.is_empty()
    }
}

/// Buffered, read-your-writes access to one backend for one session.
pub struct MapTransaction<E: SearchableEntity> {
    storage: Arc<dyn MapStorage<E>>,
    clock: Arc<dyn Clock>,
    cloner: DeepCloner,
    state: Mutex<TxState<E>>,
}

impl<E: SearchableEntity> fmt::Debug for MapTransaction<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MapTransaction")
            .field("entity_type", &E::ENTITY_TYPE)
            .field("backend", &self.storage.name())
            .field("status", &state.status)
            .field("realm_id", &state.realm_id)
            .field("buffered_ops", &state.ops.len())
            .finish()
    }
}

impl<E: SearchableEntity> MapTransaction<E> {
    /// Creates a transaction over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn MapStorage<E>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            cloner: DeepCloner::new(),
            state: Mutex::new(TxState {
                status: Status::NotStarted,
                rollback_only: false,
                realm_id: None,
                ops: Vec::new(),
                pending: HashMap::new(),
            }),
        }
    }

    /// The underlying backend.
    #[must_use]
    pub const fn storage(&self) -> &Arc<dyn MapStorage<E>> {
        &self.storage
    }

    /// Sets the realm used to route subsequent operations.
    pub fn set_realm_id(&self, realm_id: Option<&str>) {
        self.state.lock().realm_id = realm_id.map(str::to_string);
    }

    /// The active realm.
    #[must_use]
    pub fn realm_id(&self) -> Option<String> {
        self.state.lock().realm_id.clone()
    }

    // Realm routing key: the active realm for partitioned backends, `None`
    // otherwise.
    fn scope(&self) -> StorageResult<Option<String>> {
        let state = self.state.lock();
        state.ensure_usable()?;
        if self.storage.partitioned_by_realm() {
            state
                .realm_id
                .clone()
                .map(Some)
                .ok_or(StorageError::RealmNotSet(E::ENTITY_TYPE))
        } else {
            Ok(None)
        }
    }

    fn needs_merge(&self) -> bool {
        E::EXPIRABLE || !self.state.lock().is_clean()
    }

    /// Buffers a new entity, generating its id if absent.
    ///
    /// ## Errors
    ///
    /// Returns [`StorageError::Duplicate`] if the id is already visible to
    /// this transaction, or [`StorageError::RealmNotSet`] for a partitioned
    /// backend without an active realm.
    pub async fn create(&self, mut entity: E) -> StorageResult<E> {
        let scope = self.scope()?;
        if entity.id().is_none() {
            entity.set_id(&self.storage.new_key())?;
        }
        let id = entity
            .id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Internal("entity id missing after assignment".to_string()))?;

        let local = self.state.lock().local(&scope, &id);
        match local {
            Local::Present(_) => return Err(StorageError::duplicate_id(E::ENTITY_TYPE, id)),
            Local::Removed => {}
            Local::Unknown => {
                if let Some(stored) = self.storage.read(scope.as_deref(), &id).await? {
                    let now = self.clock.now_millis();
                    if self.state.lock().admit_stored(&scope, &stored, now) {
                        return Err(StorageError::duplicate_id(E::ENTITY_TYPE, id));
                    }
                }
            }
        }

        let mut state = self.state.lock();
        state.ops.push(Op {
            scope: scope.clone(),
            kind: OpKind::Create(id.clone()),
        });
        state.pending.insert((scope, id), Pending::Created(self.cloner.from(&entity)));
        tracing::trace!(entity_type = %E::ENTITY_TYPE, id = ?entity.id(), "Buffered create");
        Ok(entity)
    }

    /// Reads one entity, seeing this transaction's own writes.
    ///
    /// ## Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn read(&self, id: &str) -> StorageResult<Option<E>> {
        let scope = self.scope()?;
        let now = self.clock.now_millis();

        let local = {
            let mut state = self.state.lock();
            match state.local(&scope, id) {
                Local::Present(e) if E::EXPIRABLE && e.is_expired(now) => {
                    state.mark_deleted(&scope, id, false);
                    Local::Removed
                }
                other => other,
            }
        };
        match local {
            Local::Present(e) => return Ok(Some(e)),
            Local::Removed => return Ok(None),
            Local::Unknown => {}
        }

        let Some(stored) = self.storage.read(scope.as_deref(), id).await? else {
            return Ok(None);
        };
        let mut state = self.state.lock();
        match state.local(&scope, id) {
            Local::Present(e) => Ok(Some(e)),
            Local::Removed => Ok(None),
            Local::Unknown => Ok(state.admit_stored(&scope, &stored, now).then_some(stored)),
        }
    }

    /// Whether an entity with `id` is visible.
    ///
    /// ## Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn exists(&self, id: &str) -> StorageResult<bool> {
        Ok(self.read(id).await?.is_some())
    }

    async fn merged(&self, scope: &Option<String>, query: &QueryParameters<E::Field>) -> StorageResult<Vec<E>> {
        query.criteria().validate()?;
        let unpaged = query.without_pagination();
        let stored: Vec<E> = self
            .storage
            .read_matching(scope.as_deref(), &unpaged)
            .await?
            .try_collect()
            .await?;
        let now = self.clock.now_millis();

        let mut state = self.state.lock();
        let mut visible: Vec<E> = stored
            .into_iter()
            .filter(|e| state.admit_stored(scope, e, now))
            .collect();

        let mut expired = Vec::new();
        for ((pending_scope, id), pending) in &state.pending {
            if pending_scope != scope {
                continue;
            }
            if let Pending::Created(e) | Pending::Updated(e) = pending {
                if E::EXPIRABLE && e.is_expired(now) {
                    expired.push(id.clone());
                } else if query.criteria().matches_unchecked(e) {
                    visible.push(e.clone());
                }
            }
        }
        for id in expired {
            state.mark_deleted(scope, &id, false);
        }
        drop(state);

        Ok(query.order_and_paginate(visible))
    }

    /// Reads all matching entities as a lazy sequence.
    ///
    /// Without buffered changes the backend's own stream is returned.
    ///
    /// ## Errors
    ///
    /// Returns an error for malformed criteria or a backend failure.
    pub async fn read_matching(&self, query: &QueryParameters<E::Field>) -> StorageResult<EntityStream<E>> {
        let scope = self.scope()?;
        if !self.needs_merge() {
            return self.storage.read_matching(scope.as_deref(), query).await;
        }
        let visible = self.merged(&scope, query).await?;
        Ok(futures::stream::iter(visible.into_iter().map(Ok)).boxed())
    }

    /// Reads all matching entities into a vector.
    ///
    /// ## Errors
    ///
    /// Returns an error for malformed criteria or a backend failure.
    pub async fn read_all(&self, query: &QueryParameters<E::Field>) -> StorageResult<Vec<E>> {
        self.read_matching(query).await?.try_collect().await
    }

    /// Counts matching entities, ignoring pagination.
    ///
    /// ## Errors
    ///
    /// Returns an error for malformed criteria or a backend failure.
    pub async fn count(&self, query: &QueryParameters<E::Field>) -> StorageResult<u64> {
        let scope = self.scope()?;
        if !self.needs_merge() {
            return self.storage.count(scope.as_deref(), query).await;
        }
        let visible = self.merged(&scope, &query.without_pagination()).await?;
        Ok(visible.len() as u64)
    }

    /// Whether any entity matches.
    ///
    /// ## Errors
    ///
    /// Returns an error for malformed criteria or a backend failure.
    pub async fn exists_matching(&self, query: &QueryParameters<E::Field>) -> StorageResult<bool> {
        let scope = self.scope()?;
        if !self.needs_merge() {
            return self.storage.exists_matching(scope.as_deref(), query).await;
        }
        Ok(self.count(query).await? > 0)
    }

    /// Buffers an update. A clean entity is not written.
    ///
    /// Returns `false` if the entity was deleted earlier in this transaction,
    /// by id or by a bulk delete matching its stored state.
    ///
    /// ## Errors
    ///
    /// Returns [`StorageError::InvalidData`] for an entity without id, or an
    /// error if the backend fails.
    pub async fn update(&self, entity: E) -> StorageResult<bool> {
        let scope = self.scope()?;
        let id = entity
            .id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::InvalidData(format!("{} update without id", E::ENTITY_TYPE)))?;
        if !entity.is_dirty() {
            return Ok(true);
        }

        let key = (scope.clone(), id.clone());
        let check_stored = {
            let state = self.state.lock();
            !state.pending.contains_key(&key) && state.has_bulk_delete(&scope)
        };
        if check_stored {
            if let Some(stored) = self.storage.read(scope.as_deref(), &id).await? {
                if self.state.lock().hidden_by_bulk(&scope, &stored) {
                    return Ok(false);
                }
            }
        }

        let mut state = self.state.lock();
        match state.pending.get_mut(&key) {
            Some(Pending::Created(e) | Pending::Updated(e)) => {
                *e = entity;
                Ok(true)
            }
            Some(Pending::Deleted) => Ok(false),
            None => {
                state.ops.push(Op {
                    scope,
                    kind: OpKind::Update(id),
                });
                state.pending.insert(key, Pending::Updated(entity));
                Ok(true)
            }
        }
    }

    /// Buffers the deletion of one entity. Returns whether it was visible.
    ///
    /// ## Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn delete(&self, id: &str) -> StorageResult<bool> {
        let scope = self.scope()?;
        let local = self.state.lock().local(&scope, id);
        match local {
            Local::Present(_) => Ok(self.state.lock().mark_deleted(&scope, id, false)),
            Local::Removed => Ok(false),
            Local::Unknown => {
                let Some(stored) = self.storage.read(scope.as_deref(), id).await? else {
                    return Ok(false);
                };
                let now = self.clock.now_millis();
                let mut state = self.state.lock();
                if !state.admit_stored(&scope, &stored, now) {
                    return Ok(false);
                }
                Ok(state.mark_deleted(&scope, id, true))
            }
        }
    }

    /// Buffers the deletion of every matching entity, ignoring pagination.
    /// Returns how many visible entities it removes.
    ///
    /// ## Errors
    ///
    /// Returns an error for malformed criteria or a backend failure.
    pub async fn delete_matching(&self, query: &QueryParameters<E::Field>) -> StorageResult<u64> {
        let scope = self.scope()?;
        let unpaged = query.without_pagination();
        let visible = self.merged(&scope, &unpaged).await?;

        let mut state = self.state.lock();
        for entity in &visible {
            if let Some(id) = entity.id() {
                let id = id.to_string();
                if state.pending.contains_key(&(scope.clone(), id.clone())) {
                    state.mark_deleted(&scope, &id, false);
                }
            }
        }
        state.ops.push(Op {
            scope,
            kind: OpKind::DeleteMatching(unpaged),
        });
        Ok(visible.len() as u64)
    }

    /// Buffers the deletion of every matching entity that has expired,
    /// including ones no read has touched yet. Returns how many.
    ///
    /// ## Errors
    ///
    /// Returns an error for malformed criteria or a backend failure.
    pub async fn delete_expired(&self, query: &QueryParameters<E::Field>) -> StorageResult<u64> {
        if !E::EXPIRABLE {
            return Ok(0);
        }
        let scope = self.scope()?;
        query.criteria().validate()?;
        let stored: Vec<E> = self
            .storage
            .read_matching(scope.as_deref(), &query.without_pagination())
            .await?
            .try_collect()
            .await?;
        let now = self.clock.now_millis();

        let mut state = self.state.lock();
        let mut removed = 0;
        for entity in stored.iter().filter(|e| e.is_expired(now)) {
            let Some(id) = entity.id() else { continue };
            let untouched = !state.pending.contains_key(&(scope.clone(), id.to_string()))
                && !state.hidden_by_bulk(&scope, entity);
            if untouched && state.mark_deleted(&scope, id, true) {
                removed += 1;
            }
        }

        let buffered: Vec<String> = state
            .pending
            .iter()
            .filter_map(|((pending_scope, id), pending)| match pending {
                Pending::Created(e) | Pending::Updated(e)
                    if pending_scope == &scope && e.is_expired(now) && query.criteria().matches_unchecked(e) =>
                {
                    Some(id.clone())
                }
                _ => None,
            })
            .collect();
        for id in buffered {
            if state.mark_deleted(&scope, &id, false) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn apply(&self, ops: Vec<Op<E::Field>>, mut pending: HashMap<PendingKey, Pending<E>>) -> StorageResult<()> {
        for op in ops {
            let scope = op.scope.as_deref();
            match op.kind {
                OpKind::Create(id) => {
                    if let Some(Pending::Created(entity)) = pending.remove(&(op.scope.clone(), id)) {
                        self.storage.create(scope, entity).await?;
                    }
                }
                OpKind::Update(id) => {
                    if let Some(Pending::Updated(entity)) = pending.remove(&(op.scope.clone(), id.clone())) {
                        if self.storage.update(scope, entity).await?.is_none() {
                            tracing::debug!(entity_type = %E::ENTITY_TYPE, id, "Updated entity no longer stored");
                        }
                    }
                }
                OpKind::Delete(id) => {
                    self.storage.delete(scope, &id).await?;
                }
                OpKind::DeleteMatching(query) => {
                    let removed = self.storage.delete_matching(scope, &query).await?;
                    tracing::trace!(entity_type = %E::ENTITY_TYPE, removed, "Applied bulk delete");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<E: SearchableEntity> StorageTransaction for MapTransaction<E> {
    fn name(&self) -> String {
        format!("{}:{}", E::ENTITY_TYPE, self.storage.name())
    }

    async fn begin(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        state.ensure_usable()?;
        state.status = Status::Active;
        Ok(())
    }

    async fn commit(&self) -> StorageResult<()> {
        let (ops, pending) = {
            let mut state = self.state.lock();
            state.ensure_usable()?;
            if state.rollback_only {
                return Err(StorageError::Transaction(format!(
                    "{} transaction is marked rollback-only",
                    E::ENTITY_TYPE
                )));
            }
            state.status = Status::Committed;
            (std::mem::take(&mut state.ops), std::mem::take(&mut state.pending))
        };
        let count = ops.len();
        self.apply(ops, pending).await.inspect_err(|e| {
            tracing::error!(entity_type = %E::ENTITY_TYPE, error = %e, "Commit failed");
        })?;
        tracing::debug!(entity_type = %E::ENTITY_TYPE, ops = count, "Committed");
        Ok(())
    }

    async fn rollback(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.status != Status::Committed {
            state.status = Status::RolledBack;
        }
        state.ops.clear();
        state.pending.clear();
        Ok(())
    }

    fn set_rollback_only(&self) {
        self.state.lock().rollback_only = true;
    }

    fn is_rollback_only(&self) -> bool {
        self.state.lock().rollback_only
    }

    fn is_active(&self) -> bool {
        self.state.lock().status == Status::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::KeyGenerator;
    use crate::criteria::{Criteria, Operator};
    use crate::query::Order;
    use kc_core::{EntityType, KeyType, VirtualClock};
    use kc_model::{
        Entity, EntityMeta, FieldPath, FieldValue, RoleEntity, RoleField, SearchableField, Value,
    };
    use std::time::Duration;

    /// Minimal in-memory backend.
    struct VecStorage<E> {
        items: Mutex<HashMap<String, E>>,
        keys: KeyGenerator,
        partitioned: bool,
    }

    impl<E> VecStorage<E> {
        fn new() -> Self {
            Self {
                items: Mutex::new(HashMap::new()),
                keys: KeyGenerator::for_type(KeyType::Sequential),
                partitioned: false,
            }
        }
    }

    #[async_trait]
    impl<E: SearchableEntity> MapStorage<E> for VecStorage<E> {
        fn name(&self) -> &'static str {
            "vec"
        }

        fn partitioned_by_realm(&self) -> bool {
            self.partitioned
        }

        fn new_key(&self) -> String {
            self.keys.next_key()
        }

        async fn create(&self, _realm: Option<&str>, mut entity: E) -> StorageResult<E> {
            let id = entity.id().unwrap_or_default().to_string();
            let mut items = self.items.lock();
            if items.contains_key(&id) {
                return Err(StorageError::duplicate_id(E::ENTITY_TYPE, id));
            }
            entity.clear_dirty();
            items.insert(id, entity.clone());
            Ok(entity)
        }

        async fn read(&self, _realm: Option<&str>, id: &str) -> StorageResult<Option<E>> {
            Ok(self.items.lock().get(id).cloned())
        }

        async fn read_matching(
            &self,
            _realm: Option<&str>,
            query: &QueryParameters<E::Field>,
        ) -> StorageResult<EntityStream<E>> {
            let all: Vec<E> = self.items.lock().values().cloned().collect();
            let selected = query.select(all)?;
            Ok(futures::stream::iter(selected.into_iter().map(Ok)).boxed())
        }

        async fn update(&self, _realm: Option<&str>, mut entity: E) -> StorageResult<Option<E>> {
            let id = entity.id().unwrap_or_default().to_string();
            let mut items = self.items.lock();
            if !items.contains_key(&id) {
                return Ok(None);
            }
            entity.clear_dirty();
            items.insert(id, entity.clone());
            Ok(Some(entity))
        }

        async fn delete(&self, _realm: Option<&str>, id: &str) -> StorageResult<bool> {
            Ok(self.items.lock().remove(id).is_some())
        }

        async fn delete_matching(
            &self,
            _realm: Option<&str>,
            query: &QueryParameters<E::Field>,
        ) -> StorageResult<u64> {
            let mut items = self.items.lock();
            let before = items.len();
            items.retain(|_, e| !query.criteria().matches_unchecked(e));
            Ok((before - items.len()) as u64)
        }

        async fn count(&self, _realm: Option<&str>, query: &QueryParameters<E::Field>) -> StorageResult<u64> {
            let all: Vec<E> = self.items.lock().values().cloned().collect();
            Ok(query.without_pagination().select(all)?.len() as u64)
        }
    }

    fn setup() -> (Arc<VecStorage<RoleEntity>>, MapTransaction<RoleEntity>) {
        let storage = Arc::new(VecStorage::new());
        let tx = MapTransaction::new(
            storage.clone() as Arc<dyn MapStorage<RoleEntity>>,
            Arc::new(VirtualClock::new()),
        );
        (storage, tx)
    }

    fn by_realm(realm: &str) -> QueryParameters<RoleField> {
        Criteria::new()
            .compare(RoleField::RealmId, Operator::Eq, realm)
            .into()
    }

    #[tokio::test]
    async fn writes_are_buffered_until_commit() {
        let (storage, tx) = setup();
        tx.begin().await.unwrap();

        let role = tx.create(RoleEntity::new_realm_role("r1", "admin")).await.unwrap();
        let id = role.id().unwrap().to_string();

        assert!(tx.read(&id).await.unwrap().is_some());
        assert!(storage.items.lock().is_empty());

        tx.commit().await.unwrap();
        let stored = storage.items.lock().get(&id).cloned().unwrap();
        assert_eq!(stored.name(), "admin");
        assert!(!stored.is_dirty());
    }

    #[tokio::test]
    async fn rollback_discards_everything() {
        let (storage, tx) = setup();
        tx.create(RoleEntity::new_realm_role("r1", "admin")).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(storage.items.lock().is_empty());
        assert!(tx.read("1").await.is_err());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let (_storage, tx) = setup();
        let mut role = RoleEntity::new_realm_role("r1", "admin");
        role.set_id("fixed").unwrap();
        tx.create(role.clone()).await.unwrap();

        let err = tx.create(role).await.unwrap_err();
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn read_matching_merges_buffered_changes() {
        let (_storage, tx) = setup();
        for name in ["a", "b", "c"] {
            tx.create(RoleEntity::new_realm_role("r1", name)).await.unwrap();
        }
        tx.commit().await.unwrap();

        let tx = MapTransaction::new(tx.storage().clone(), Arc::new(VirtualClock::new()));
        let mut b = tx.read("2").await.unwrap().unwrap();
        b.set_name("z");
        tx.update(b).await.unwrap();
        tx.delete("1").await.unwrap();
        tx.create(RoleEntity::new_realm_role("r1", "d")).await.unwrap();

        let query = by_realm("r1").order_by(RoleField::Name, Order::Ascending);
        let names: Vec<String> = tx
            .read_all(&query)
            .await
            .unwrap()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, vec!["c", "d", "z"]);
        assert_eq!(tx.count(&by_realm("r1")).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn create_then_delete_leaves_no_trace() {
        let (storage, tx) = setup();
        let role = tx.create(RoleEntity::new_realm_role("r1", "temp")).await.unwrap();
        assert!(tx.delete(role.id().unwrap()).await.unwrap());
        tx.commit().await.unwrap();
        assert!(storage.items.lock().is_empty());
    }

    #[tokio::test]
    async fn bulk_delete_hides_stored_matches() {
        let (storage, tx) = setup();
        tx.create(RoleEntity::new_realm_role("r1", "a")).await.unwrap();
        tx.create(RoleEntity::new_realm_role("r2", "b")).await.unwrap();
        tx.commit().await.unwrap();

        let tx = MapTransaction::new(tx.storage().clone(), Arc::new(VirtualClock::new()));
        assert_eq!(tx.delete_matching(&by_realm("r1")).await.unwrap(), 1);
        assert!(tx.read("1").await.unwrap().is_none());
        assert!(tx.read("2").await.unwrap().is_some());
        assert_eq!(storage.items.lock().len(), 2);

        tx.commit().await.unwrap();
        assert_eq!(storage.items.lock().len(), 1);
    }

    #[tokio::test]
    async fn update_after_bulk_delete_is_refused() {
        let (storage, tx) = setup();
        tx.create(RoleEntity::new_realm_role("r1", "a")).await.unwrap();
        tx.create(RoleEntity::new_realm_role("r2", "b")).await.unwrap();
        tx.commit().await.unwrap();

        let tx = MapTransaction::new(tx.storage().clone(), Arc::new(VirtualClock::new()));
        let mut held = tx.read("1").await.unwrap().unwrap();
        assert_eq!(tx.delete_matching(&by_realm("r1")).await.unwrap(), 1);

        held.set_description(Some("renamed".into()));
        assert!(!tx.update(held).await.unwrap());
        assert!(tx.read("1").await.unwrap().is_none());

        let mut other = tx.read("2").await.unwrap().unwrap();
        other.set_description(Some("kept".into()));
        assert!(tx.update(other).await.unwrap());

        tx.commit().await.unwrap();
        let items = storage.items.lock();
        assert_eq!(items.len(), 1);
        assert_eq!(items.get("2").and_then(RoleEntity::description), Some("kept"));
    }

    #[tokio::test]
    async fn clean_updates_are_not_written() {
        let (_storage, tx) = setup();
        tx.create(RoleEntity::new_realm_role("r1", "a")).await.unwrap();
        tx.commit().await.unwrap();

        let tx = MapTransaction::new(tx.storage().clone(), Arc::new(VirtualClock::new()));
        let role = tx.read("1").await.unwrap().unwrap();
        assert!(tx.update(role).await.unwrap());
        assert!(tx.state.lock().is_clean());
    }

    #[tokio::test]
    async fn rollback_only_refuses_commit() {
        let (storage, tx) = setup();
        tx.create(RoleEntity::new_realm_role("r1", "a")).await.unwrap();
        tx.set_rollback_only();
        assert!(tx.commit().await.is_err());
        assert!(storage.items.lock().is_empty());
    }

    #[tokio::test]
    async fn partitioned_backend_requires_realm() {
        let storage = Arc::new(VecStorage::<RoleEntity> {
            partitioned: true,
            ..VecStorage::new()
        });
        let tx = MapTransaction::new(storage as Arc<dyn MapStorage<RoleEntity>>, Arc::new(VirtualClock::new()));

        let err = tx.create(RoleEntity::new_realm_role("r1", "a")).await.unwrap_err();
        assert!(matches!(err, StorageError::RealmNotSet(EntityType::Role)));

        tx.set_realm_id(Some("r1"));
        assert!(tx.create(RoleEntity::new_realm_role("r1", "a")).await.is_ok());
    }

    #[derive(Debug, Clone, Default)]
    struct Ticket {
        meta: EntityMeta,
        expires_at: i64,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TicketField {
        Id,
    }

    impl SearchableField for TicketField {
        fn name(&self) -> &'static str {
            "id"
        }

        fn path(&self) -> FieldPath {
            FieldPath::Scalar("id")
        }
    }

    impl Entity for Ticket {
        const ENTITY_TYPE: EntityType = EntityType::UserSession;
        const EXPIRABLE: bool = true;

        fn meta(&self) -> &EntityMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }

        fn expiration(&self) -> Option<i64> {
            Some(self.expires_at)
        }
    }

    impl SearchableEntity for Ticket {
        type Field = TicketField;

        fn field_value(&self, field: TicketField, _keys: &[Value]) -> FieldValue {
            match field {
                TicketField::Id => FieldValue::from_opt(self.id()),
            }
        }
    }

    #[tokio::test]
    async fn expired_entities_are_hidden_and_deleted() {
        let clock = Arc::new(VirtualClock::starting_at(1_000));
        let storage = Arc::new(VecStorage::<Ticket>::new());
        let backend = storage.clone() as Arc<dyn MapStorage<Ticket>>;

        let tx = MapTransaction::new(backend.clone(), clock.clone());
        tx.create(Ticket {
            expires_at: 5_000,
            ..Ticket::default()
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        clock.advance(Duration::from_secs(10));
        let tx = MapTransaction::new(backend, clock);
        assert!(tx.read("1").await.unwrap().is_none());
        assert_eq!(tx.count(&QueryParameters::default()).await.unwrap(), 0);
        assert_eq!(storage.items.lock().len(), 1);

        tx.commit().await.unwrap();
        assert!(storage.items.lock().is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_untouched_expired_entities() {
        let clock = Arc::new(VirtualClock::starting_at(1_000));
        let storage = Arc::new(VecStorage::<Ticket>::new());
        let backend = storage.clone() as Arc<dyn MapStorage<Ticket>>;

        let tx = MapTransaction::new(backend.clone(), clock.clone());
        for expires_at in [2_000, 3_000, 60_000] {
            tx.create(Ticket {
                expires_at,
                ..Ticket::default()
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        clock.advance(Duration::from_secs(5));
        let tx = MapTransaction::new(backend, clock);
        assert_eq!(tx.delete_expired(&QueryParameters::default()).await.unwrap(), 2);
        assert_eq!(tx.delete_expired(&QueryParameters::default()).await.unwrap(), 0);
        tx.commit().await.unwrap();
        assert_eq!(storage.items.lock().len(), 1);
    }
}
