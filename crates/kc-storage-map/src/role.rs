//! Map-backed role provider.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use kc_core::{EntityType, RemovalEvent};
use kc_model::{Entity, RoleEntity, RoleField};
use kc_storage::{
    Criteria, InvalidationSink, MapTransaction, Operator, Order, QueryParameters, RealmProvider, RoleProvider,
    StorageError, StorageResult,
};

use crate::support::{contains, dispatch, modify, read_in_realm, require_realm};

/// Role provider over a [`MapTransaction`].
pub struct MapRoleProvider {
    tx: Arc<MapTransaction<RoleEntity>>,
    realms: Arc<dyn RealmProvider>,
    events: Weak<dyn InvalidationSink>,
}

impl std::fmt::Debug for MapRoleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapRoleProvider").field("tx", &self.tx).finish_non_exhaustive()
    }
}

fn in_realm(realm_id: &str) -> Criteria<RoleField> {
    Criteria::new().compare(RoleField::RealmId, Operator::Eq, realm_id)
}

// Realm roles have no client id.
fn in_container(realm_id: &str, client_id: Option<&str>) -> Criteria<RoleField> {
    match client_id {
        Some(client) => in_realm(realm_id).compare(RoleField::ClientId, Operator::Eq, client),
        None => in_realm(realm_id).not_exists(RoleField::ClientId),
    }
}

impl MapRoleProvider {
    /// Creates a provider.
    #[must_use]
    pub fn new(
        tx: Arc<MapTransaction<RoleEntity>>,
        realms: Arc<dyn RealmProvider>,
        events: Weak<dyn InvalidationSink>,
    ) -> Self {
        Self { tx, realms, events }
    }

    async fn select(&self, realm_id: &str, query: QueryParameters<RoleField>) -> StorageResult<Vec<RoleEntity>> {
        self.tx.set_realm_id(Some(realm_id));
        self.tx.read_all(&query).await
    }

    async fn find(&self, realm_id: &str, client_id: Option<&str>, name: &str) -> StorageResult<Option<RoleEntity>> {
        let query = in_container(realm_id, client_id).compare(RoleField::Name, Operator::Eq, name);
        Ok(self.select(realm_id, query.into()).await?.into_iter().next())
    }

    async fn ensure_name_free(
        &self,
        realm_id: &str,
        client_id: Option<&str>,
        name: &str,
        own_id: Option<&str>,
    ) -> StorageResult<()> {
        if let Some(existing) = self.find(realm_id, client_id, name).await? {
            if existing.id() != own_id {
                return Err(StorageError::duplicate(EntityType::Role, "name", name));
            }
        }
        Ok(())
    }

    async fn add(&self, realm_id: &str, id: Option<&str>, mut role: RoleEntity) -> StorageResult<RoleEntity> {
        require_realm(self.realms.as_ref(), realm_id).await?;
        self.ensure_name_free(realm_id, role.client_id(), role.name(), None)
            .await?;
        if let Some(id) = id {
            role.set_id(id)?;
        }
        self.tx.set_realm_id(Some(realm_id));
        self.tx.create(role).await
    }
}

#[async_trait]
impl RoleProvider for MapRoleProvider {
    async fn add_realm_role(&self, realm_id: &str, id: Option<&str>, name: &str) -> StorageResult<RoleEntity> {
        self.add(realm_id, id, RoleEntity::new_realm_role(realm_id, name)).await
    }

    async fn add_client_role(
        &self,
        realm_id: &str,
        client_id: &str,
        id: Option<&str>,
        name: &str,
    ) -> StorageResult<RoleEntity> {
        self.add(realm_id, id, RoleEntity::new_client_role(realm_id, client_id, name))
            .await
    }

    async fn get_role_by_id(&self, realm_id: &str, id: &str) -> StorageResult<Option<RoleEntity>> {
        read_in_realm(&self.tx, realm_id, id).await
    }

    async fn get_realm_role(&self, realm_id: &str, name: &str) -> StorageResult<Option<RoleEntity>> {
        self.find(realm_id, None, name).await
    }

    async fn get_client_role(&self, realm_id: &str, client_id: &str, name: &str) -> StorageResult<Option<RoleEntity>> {
        self.find(realm_id, Some(client_id), name).await
    }

    async fn get_realm_roles(&self, realm_id: &str, first: Option<i32>, max: Option<i32>) -> StorageResult<Vec<RoleEntity>> {
        let query = QueryParameters::from(in_container(realm_id, None))
            .order_by(RoleField::Name, Order::Ascending)
            .pagination(first, max);
        self.select(realm_id, query).await
    }

    async fn get_client_roles(
        &self,
        realm_id: &str,
        client_id: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<RoleEntity>> {
        let query = QueryParameters::from(in_container(realm_id, Some(client_id)))
            .order_by(RoleField::Name, Order::Ascending)
            .pagination(first, max);
        self.select(realm_id, query).await
    }

    async fn search_for_roles(
        &self,
        realm_id: &str,
        search: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<RoleEntity>> {
        let pattern = contains(search);
        let text = Criteria::or([
            Criteria::new().compare(RoleField::Name, Operator::ILike, pattern.as_str()),
            Criteria::new().compare(RoleField::Description, Operator::ILike, pattern.as_str()),
        ]);
        let query = QueryParameters::from(in_realm(realm_id).with(text))
            .order_by(RoleField::Name, Order::Ascending)
            .pagination(first, max);
        self.select(realm_id, query).await
    }

    async fn update_role(&self, role: RoleEntity) -> StorageResult<bool> {
        let (Some(id), Some(realm_id)) = (role.id().map(str::to_string), role.realm_id().map(str::to_string)) else {
            return Err(StorageError::InvalidData("role update without id or realm".to_string()));
        };
        let Some(stored) = read_in_realm(&self.tx, &realm_id, &id).await? else {
            return Ok(false);
        };
        if stored.name() != role.name() {
            self.ensure_name_free(&realm_id, role.client_id(), role.name(), Some(&id))
                .await?;
        }
        self.tx.update(role).await
    }

    async fn add_composite(&self, realm_id: &str, id: &str, member_id: &str) -> StorageResult<()> {
        modify(&self.tx, realm_id, id, |r: &mut RoleEntity| r.add_composite_role(member_id)).await
    }

    async fn remove_composite(&self, realm_id: &str, id: &str, member_id: &str) -> StorageResult<bool> {
        modify(&self.tx, realm_id, id, |r: &mut RoleEntity| r.remove_composite_role(member_id)).await
    }

    async fn remove_role(&self, realm_id: &str, id: &str) -> StorageResult<bool> {
        let Some(role) = read_in_realm(&self.tx, realm_id, id).await? else {
            return Ok(false);
        };
        let mut event = RemovalEvent::before(EntityType::Role, realm_id, id);
        if let Some(client_id) = role.client_id() {
            event = event.with_container(client_id);
        }
        dispatch(&self.events, event.clone()).await?;
        self.tx.set_realm_id(Some(realm_id));
        self.tx.delete(id).await?;
        dispatch(&self.events, event.into_after()).await?;
        Ok(true)
    }

    async fn remove_client_roles(&self, realm_id: &str, client_id: &str) -> StorageResult<u64> {
        let mut removed = 0;
        for role in self.get_client_roles(realm_id, client_id, None, None).await? {
            if let Some(id) = role.id() {
                if self.remove_role(realm_id, id).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn remove_roles(&self, realm_id: &str) -> StorageResult<u64> {
        self.tx.set_realm_id(Some(realm_id));
        self.tx.delete_matching(&in_realm(realm_id).into()).await
    }

    async fn remove_role_references(&self, realm_id: &str, role_id: &str) -> StorageResult<u64> {
        let query = in_realm(realm_id).compare(RoleField::CompositeRole, Operator::Eq, role_id);
        let mut changed = 0;
        for mut role in self.select(realm_id, query.into()).await? {
            if role.remove_composite_role(role_id) {
                self.tx.update(role).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }
}
