//! Map-backed group provider.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use kc_core::{EntityType, RemovalEvent};
use kc_model::{Entity, GroupEntity, GroupField};
use kc_storage::{
    Criteria, GroupProvider, InvalidationSink, MapTransaction, Operator, Order, QueryParameters, RealmProvider,
    StorageError, StorageResult,
};

use crate::support::{contains, dispatch, modify, read_in_realm, require_realm};

/// Group provider over a [`MapTransaction`].
pub struct MapGroupProvider {
    tx: Arc<MapTransaction<GroupEntity>>,
    realms: Arc<dyn RealmProvider>,
    events: Weak<dyn InvalidationSink>,
}

impl std::fmt::Debug for MapGroupProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapGroupProvider").field("tx", &self.tx).finish_non_exhaustive()
    }
}

fn in_realm(realm_id: &str) -> Criteria<GroupField> {
    Criteria::new().compare(GroupField::RealmId, Operator::Eq, realm_id)
}

fn siblings(realm_id: &str, parent_id: Option<&str>) -> Criteria<GroupField> {
    match parent_id {
        Some(parent) => in_realm(realm_id).compare(GroupField::ParentId, Operator::Eq, parent),
        None => in_realm(realm_id).not_exists(GroupField::ParentId),
    }
}

impl MapGroupProvider {
    /// Creates a provider.
    #[must_use]
    pub fn new(
        tx: Arc<MapTransaction<GroupEntity>>,
        realms: Arc<dyn RealmProvider>,
        events: Weak<dyn InvalidationSink>,
    ) -> Self {
        Self { tx, realms, events }
    }

    async fn select(&self, realm_id: &str, query: QueryParameters<GroupField>) -> StorageResult<Vec<GroupEntity>> {
        self.tx.set_realm_id(Some(realm_id));
        self.tx.read_all(&query).await
    }

    async fn ensure_name_free(
        &self,
        realm_id: &str,
        parent_id: Option<&str>,
        name: &str,
        own_id: Option<&str>,
    ) -> StorageResult<()> {
        let query = siblings(realm_id, parent_id).compare(GroupField::Name, Operator::Eq, name);
        let clash = self.select(realm_id, query.into()).await?.iter().any(|g| g.id() != own_id);
        if clash {
            return Err(StorageError::duplicate(EntityType::Group, "name", name));
        }
        Ok(())
    }

    async fn require_group(&self, realm_id: &str, id: &str) -> StorageResult<GroupEntity> {
        read_in_realm(&self.tx, realm_id, id)
            .await?
            .ok_or_else(|| StorageError::not_found(EntityType::Group, id))
    }
}

#[async_trait]
impl GroupProvider for MapGroupProvider {
    async fn create_group(
        &self,
        realm_id: &str,
        id: Option<&str>,
        name: &str,
        parent_id: Option<&str>,
    ) -> StorageResult<GroupEntity> {
        require_realm(self.realms.as_ref(), realm_id).await?;
        if let Some(parent) = parent_id {
            self.require_group(realm_id, parent).await?;
        }
        self.ensure_name_free(realm_id, parent_id, name, None).await?;

        let mut group = GroupEntity::new(realm_id, name, parent_id.map(str::to_string));
        if let Some(id) = id {
            group.set_id(id)?;
        }
        self.tx.set_realm_id(Some(realm_id));
        self.tx.create(group).await
    }

    async fn get_group_by_id(&self, realm_id: &str, id: &str) -> StorageResult<Option<GroupEntity>> {
        read_in_realm(&self.tx, realm_id, id).await
    }

    async fn get_groups(&self, realm_id: &str, first: Option<i32>, max: Option<i32>) -> StorageResult<Vec<GroupEntity>> {
        let query = QueryParameters::from(in_realm(realm_id))
            .order_by(GroupField::Name, Order::Ascending)
            .pagination(first, max);
        self.select(realm_id, query).await
    }

    async fn get_top_level_groups(
        &self,
        realm_id: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<GroupEntity>> {
        let query = QueryParameters::from(siblings(realm_id, None))
            .order_by(GroupField::Name, Order::Ascending)
            .pagination(first, max);
        self.select(realm_id, query).await
    }

    async fn get_sub_groups(&self, realm_id: &str, parent_id: &str) -> StorageResult<Vec<GroupEntity>> {
        let query = QueryParameters::from(siblings(realm_id, Some(parent_id))).order_by(GroupField::Name, Order::Ascending);
        self.select(realm_id, query).await
    }

    async fn search_groups_by_name(
        &self,
        realm_id: &str,
        search: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<GroupEntity>> {
        let query = QueryParameters::from(in_realm(realm_id).compare(GroupField::Name, Operator::ILike, contains(search)))
            .order_by(GroupField::Name, Order::Ascending)
            .pagination(first, max);
        self.select(realm_id, query).await
    }

    async fn count_groups(&self, realm_id: &str, only_top_level: bool) -> StorageResult<u64> {
        let criteria = if only_top_level {
            siblings(realm_id, None)
        } else {
            in_realm(realm_id)
        };
        self.tx.set_realm_id(Some(realm_id));
        self.tx.count(&criteria.into()).await
    }

    async fn update_group(&self, group: GroupEntity) -> StorageResult<bool> {
        let (Some(id), Some(realm_id)) = (group.id().map(str::to_string), group.realm_id().map(str::to_string)) else {
            return Err(StorageError::InvalidData("group update without id or realm".to_string()));
        };
        let Some(stored) = read_in_realm(&self.tx, &realm_id, &id).await? else {
            return Ok(false);
        };
        if stored.name() != group.name() || stored.parent_id() != group.parent_id() {
            self.ensure_name_free(&realm_id, group.parent_id(), group.name(), Some(&id))
                .await?;
        }
        self.tx.update(group).await
    }

    async fn move_group(&self, realm_id: &str, id: &str, new_parent_id: Option<&str>) -> StorageResult<()> {
        let mut group = self.require_group(realm_id, id).await?;
        if group.parent_id() == new_parent_id {
            return Ok(());
        }

        // Walk up from the new parent; reaching the moved group means a cycle.
        let mut ancestor = new_parent_id.map(str::to_string);
        while let Some(current) = ancestor {
            if current == id {
                return Err(StorageError::InvalidData(format!(
                    "group {id} cannot be moved below itself"
                )));
            }
            ancestor = self
                .require_group(realm_id, &current)
                .await?
                .parent_id()
                .map(str::to_string);
        }

        self.ensure_name_free(realm_id, new_parent_id, group.name(), Some(id))
            .await?;
        group.set_parent_id(new_parent_id.map(str::to_string));
        self.tx.update(group).await?;
        Ok(())
    }

    async fn grant_role(&self, realm_id: &str, id: &str, role_id: &str) -> StorageResult<()> {
        modify(&self.tx, realm_id, id, |g: &mut GroupEntity| g.grant_role(role_id)).await
    }

    async fn revoke_role(&self, realm_id: &str, id: &str, role_id: &str) -> StorageResult<bool> {
        modify(&self.tx, realm_id, id, |g: &mut GroupEntity| g.revoke_role(role_id)).await
    }

    async fn remove_group(&self, realm_id: &str, id: &str) -> StorageResult<bool> {
        if read_in_realm(&self.tx, realm_id, id).await?.is_none() {
            return Ok(false);
        }
        for child in self.get_sub_groups(realm_id, id).await? {
            if let Some(child_id) = child.id() {
                self.remove_group(realm_id, child_id).await?;
            }
        }

        let event = RemovalEvent::before(EntityType::Group, realm_id, id);
        dispatch(&self.events, event.clone()).await?;
        self.tx.set_realm_id(Some(realm_id));
        self.tx.delete(id).await?;
        dispatch(&self.events, event.into_after()).await?;
        Ok(true)
    }

    async fn remove_groups(&self, realm_id: &str) -> StorageResult<u64> {
        self.tx.set_realm_id(Some(realm_id));
        self.tx.delete_matching(&in_realm(realm_id).into()).await
    }

    async fn remove_role_references(&self, realm_id: &str, role_id: &str) -> StorageResult<u64> {
        let query = in_realm(realm_id).compare(GroupField::AssignedRole, Operator::Eq, role_id);
        let mut changed = 0;
        for mut group in self.select(realm_id, query.into()).await? {
            if group.revoke_role(role_id) {
                self.tx.update(group).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::Fixture;
    use kc_core::{EntityType, RemovalPhase};
    use kc_model::Entity;
    use kc_storage::GroupProvider;

    async fn group(fx: &Fixture, name: &str, parent: Option<&str>) -> String {
        fx.groups
            .create_group("acme", None, name, parent)
            .await
            .unwrap()
            .id()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn sibling_names_are_unique() {
        let fx = Fixture::with_realm("acme").await;
        let staff = group(&fx, "staff", None).await;
        group(&fx, "admins", Some(&staff)).await;

        assert!(fx.groups.create_group("acme", None, "staff", None).await.unwrap_err().is_duplicate());
        assert!(fx
            .groups
            .create_group("acme", None, "admins", Some(&staff))
            .await
            .unwrap_err()
            .is_duplicate());
        group(&fx, "admins", None).await;

        assert_eq!(fx.groups.count_groups("acme", true).await.unwrap(), 2);
        assert_eq!(fx.groups.count_groups("acme", false).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn moving_below_own_descendant_is_rejected() {
        let fx = Fixture::with_realm("acme").await;
        let top = group(&fx, "top", None).await;
        let mid = group(&fx, "mid", Some(&top)).await;
        let leaf = group(&fx, "leaf", Some(&mid)).await;

        let err = fx.groups.move_group("acme", &top, Some(&leaf)).await.unwrap_err();
        assert!(matches!(err, kc_storage::StorageError::InvalidData(_)));

        fx.groups.move_group("acme", &leaf, None).await.unwrap();
        let top_level: Vec<_> = fx
            .groups
            .get_top_level_groups("acme", None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|g| g.name().to_string())
            .collect();
        assert_eq!(top_level, ["leaf", "top"]);
    }

    #[tokio::test]
    async fn removal_takes_subgroups_first() {
        let fx = Fixture::with_realm("acme").await;
        let top = group(&fx, "top", None).await;
        let child = group(&fx, "child", Some(&top)).await;

        assert!(fx.groups.remove_group("acme", &top).await.unwrap());
        let before: Vec<_> = fx
            .events()
            .into_iter()
            .filter(|e| e.entity_type == EntityType::Group && e.phase == RemovalPhase::BeforeRemove)
            .map(|e| e.id)
            .collect();
        assert_eq!(before, [child, top]);
        assert_eq!(fx.groups.count_groups("acme", false).await.unwrap(), 0);
    }
}
