//! Map-backed realm provider.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use kc_core::{EntityType, RemovalEvent};
use kc_model::{Entity, RealmEntity, RealmField};
use kc_storage::{
    Criteria, InvalidationSink, MapTransaction, Operator, Order, QueryParameters, RealmProvider, StorageError,
    StorageResult,
};

use crate::support::dispatch;

/// Realm provider over a [`MapTransaction`].
pub struct MapRealmProvider {
    tx: Arc<MapTransaction<RealmEntity>>,
    events: Weak<dyn InvalidationSink>,
}

impl std::fmt::Debug for MapRealmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapRealmProvider").field("tx", &self.tx).finish_non_exhaustive()
    }
}

impl MapRealmProvider {
    /// Creates a provider buffering through `tx` and raising removal events
    /// on `events`.
    #[must_use]
    pub fn new(tx: Arc<MapTransaction<RealmEntity>>, events: Weak<dyn InvalidationSink>) -> Self {
        Self { tx, events }
    }

    fn by_name(name: &str) -> QueryParameters<RealmField> {
        Criteria::new().compare(RealmField::Name, Operator::Eq, name).into()
    }

    async fn ensure_name_free(&self, name: &str, own_id: Option<&str>) -> StorageResult<()> {
        let clash = self
            .tx
            .read_all(&Self::by_name(name))
            .await?
            .iter()
            .any(|r| r.id() != own_id);
        if clash {
            return Err(StorageError::duplicate(EntityType::Realm, "name", name));
        }
        Ok(())
    }
}

#[async_trait]
impl RealmProvider for MapRealmProvider {
    async fn create_realm(&self, id: Option<&str>, name: &str) -> StorageResult<RealmEntity> {
        self.ensure_name_free(name, None).await?;
        let mut realm = RealmEntity::new(name);
        if let Some(id) = id {
            realm.set_id(id)?;
        }
        let realm = self.tx.create(realm).await?;
        tracing::debug!(realm_id = ?realm.id(), name, "Created realm");
        Ok(realm)
    }

    async fn get_realm(&self, id: &str) -> StorageResult<Option<RealmEntity>> {
        self.tx.read(id).await
    }

    async fn get_realm_by_name(&self, name: &str) -> StorageResult<Option<RealmEntity>> {
        Ok(self.tx.read_all(&Self::by_name(name)).await?.into_iter().next())
    }

    async fn get_realms(&self, first: Option<i32>, max: Option<i32>) -> StorageResult<Vec<RealmEntity>> {
        let query = QueryParameters::default()
            .order_by(RealmField::Name, Order::Ascending)
            .pagination(first, max);
        self.tx.read_all(&query).await
    }

    async fn get_realms_with_attribute(&self, name: &str, value: &str) -> StorageResult<Vec<RealmEntity>> {
        let query = QueryParameters::from(Criteria::new().compare_keyed(RealmField::Attribute, name, Operator::Eq, value))
            .order_by(RealmField::Name, Order::Ascending);
        self.tx.read_all(&query).await
    }

    async fn count_realms(&self) -> StorageResult<u64> {
        self.tx.count(&QueryParameters::default()).await
    }

    async fn update_realm(&self, realm: RealmEntity) -> StorageResult<bool> {
        let Some(id) = realm.id().map(str::to_string) else {
            return Err(StorageError::InvalidData("realm update without id".to_string()));
        };
        let Some(stored) = self.tx.read(&id).await? else {
            return Ok(false);
        };
        if stored.name() != realm.name() {
            self.ensure_name_free(realm.name(), Some(&id)).await?;
        }
        self.tx.update(realm).await
    }

    async fn remove_realm(&self, id: &str) -> StorageResult<bool> {
        if self.tx.read(id).await?.is_none() {
            return Ok(false);
        }
        let event = RemovalEvent::before(EntityType::Realm, id, id);
        dispatch(&self.events, event.clone()).await?;
        self.tx.delete(id).await?;
        dispatch(&self.events, event.into_after()).await?;
        tracing::info!(realm_id = id, "Removed realm");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    #[tokio::test]
    async fn names_are_unique() {
        let fx = Fixture::with_realm("acme").await;
        let err = fx.realms.create_realm(None, "acme").await.unwrap_err();
        assert!(err.is_duplicate());

        let other = fx.realms.create_realm(None, "globex").await.unwrap();
        let mut renamed = other.clone();
        renamed.set_name("acme");
        assert!(fx.realms.update_realm(renamed).await.unwrap_err().is_duplicate());
    }

    #[tokio::test]
    async fn listing_is_ordered_by_name_and_paginated() {
        let fx = Fixture::with_realm("m").await;
        for name in ["z", "a"] {
            fx.realms.create_realm(None, name).await.unwrap();
        }
        fx.commit_realms().await;

        let tx = Arc::new(MapTransaction::new(fx.realm_tx.storage().clone(), fx.clock.clone()));
        let realms = MapRealmProvider::new(tx, Weak::<crate::testing::Recorder>::new());
        let names: Vec<_> = realms
            .get_realms(Some(1), Some(5))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, ["m", "z"]);
        assert_eq!(realms.count_realms().await.unwrap(), 3);
        assert!(realms.get_realm_by_name("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn removal_brackets_the_delete_with_events() {
        let fx = Fixture::with_realm("acme").await;
        assert!(fx.realms.remove_realm("acme").await.unwrap());
        assert!(fx.realms.get_realm("acme").await.unwrap().is_none());
        assert!(!fx.realms.remove_realm("acme").await.unwrap());

        let events = fx.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], RemovalEvent::before(EntityType::Realm, "acme", "acme"));
        assert_eq!(events[1].phase, kc_core::RemovalPhase::AfterRemove);
    }

    #[tokio::test]
    async fn removal_without_session_fails() {
        let fx = Fixture::with_realm("acme").await;
        let orphan = MapRealmProvider::new(fx.realm_tx.clone(), Weak::<crate::testing::Recorder>::new());
        let err = orphan.remove_realm("acme").await.unwrap_err();
        assert!(matches!(err, StorageError::Transaction(_)));
    }
}
