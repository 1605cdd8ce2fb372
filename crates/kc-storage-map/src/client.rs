//! Map-backed client provider.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use kc_core::{EntityType, RemovalEvent};
use kc_model::{ClientEntity, ClientField, Entity};
use kc_storage::{
    ClientProvider, Criteria, InvalidationSink, MapTransaction, Operator, Order, QueryParameters, RealmProvider,
    StorageError, StorageResult,
};

use crate::support::{contains, dispatch, modify, read_in_realm, require_realm};

/// Client provider over a [`MapTransaction`].
pub struct MapClientProvider {
    tx: Arc<MapTransaction<ClientEntity>>,
    realms: Arc<dyn RealmProvider>,
    events: Weak<dyn InvalidationSink>,
}

impl std::fmt::Debug for MapClientProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapClientProvider").field("tx", &self.tx).finish_non_exhaustive()
    }
}

fn in_realm(realm_id: &str) -> Criteria<ClientField> {
    Criteria::new().compare(ClientField::RealmId, Operator::Eq, realm_id)
}

impl MapClientProvider {
    /// Creates a provider.
    #[must_use]
    pub fn new(
        tx: Arc<MapTransaction<ClientEntity>>,
        realms: Arc<dyn RealmProvider>,
        events: Weak<dyn InvalidationSink>,
    ) -> Self {
        Self { tx, realms, events }
    }

    async fn select(&self, realm_id: &str, query: QueryParameters<ClientField>) -> StorageResult<Vec<ClientEntity>> {
        self.tx.set_realm_id(Some(realm_id));
        self.tx.read_all(&query).await
    }

    async fn ensure_client_id_free(&self, realm_id: &str, client_id: &str, own_id: Option<&str>) -> StorageResult<()> {
        let query = in_realm(realm_id).compare(ClientField::ClientId, Operator::Eq, client_id);
        let clash = self.select(realm_id, query.into()).await?.iter().any(|c| c.id() != own_id);
        if clash {
            return Err(StorageError::duplicate(EntityType::Client, "client_id", client_id));
        }
        Ok(())
    }
}

#[async_trait]
impl ClientProvider for MapClientProvider {
    async fn add_client(&self, realm_id: &str, id: Option<&str>, client_id: &str) -> StorageResult<ClientEntity> {
        require_realm(self.realms.as_ref(), realm_id).await?;
        self.ensure_client_id_free(realm_id, client_id, None).await?;
        let mut client = ClientEntity::new(realm_id, client_id);
        if let Some(id) = id {
            client.set_id(id)?;
        }
        self.tx.set_realm_id(Some(realm_id));
        self.tx.create(client).await
    }

    async fn get_client_by_id(&self, realm_id: &str, id: &str) -> StorageResult<Option<ClientEntity>> {
        read_in_realm(&self.tx, realm_id, id).await
    }

    async fn get_client_by_client_id(&self, realm_id: &str, client_id: &str) -> StorageResult<Option<ClientEntity>> {
        let query = in_realm(realm_id).compare(ClientField::ClientId, Operator::Eq, client_id);
        Ok(self.select(realm_id, query.into()).await?.into_iter().next())
    }

    async fn get_clients(&self, realm_id: &str, first: Option<i32>, max: Option<i32>) -> StorageResult<Vec<ClientEntity>> {
        let query = QueryParameters::from(in_realm(realm_id))
            .order_by(ClientField::ClientId, Order::Ascending)
            .pagination(first, max);
        self.select(realm_id, query).await
    }

    async fn search_clients_by_client_id(
        &self,
        realm_id: &str,
        search: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<ClientEntity>> {
        let query = QueryParameters::from(in_realm(realm_id).compare(ClientField::ClientId, Operator::ILike, contains(search)))
            .order_by(ClientField::ClientId, Order::Ascending)
            .pagination(first, max);
        self.select(realm_id, query).await
    }

    async fn search_clients_by_attributes(
        &self,
        realm_id: &str,
        attributes: &[(&str, &str)],
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<ClientEntity>> {
        let criteria = attributes.iter().fold(in_realm(realm_id), |c, (name, value)| {
            c.compare_keyed(ClientField::Attribute, name, Operator::Eq, *value)
        });
        let query = QueryParameters::from(criteria)
            .order_by(ClientField::ClientId, Order::Ascending)
            .pagination(first, max);
        self.select(realm_id, query).await
    }

    async fn count_clients(&self, realm_id: &str) -> StorageResult<u64> {
        self.tx.set_realm_id(Some(realm_id));
        self.tx.count(&in_realm(realm_id).into()).await
    }

    async fn update_client(&self, client: ClientEntity) -> StorageResult<bool> {
        let (Some(id), Some(realm_id)) = (client.id().map(str::to_string), client.realm_id().map(str::to_string)) else {
            return Err(StorageError::InvalidData("client update without id or realm".to_string()));
        };
        let Some(stored) = read_in_realm(&self.tx, &realm_id, &id).await? else {
            return Ok(false);
        };
        if stored.client_id() != client.client_id() {
            self.ensure_client_id_free(&realm_id, client.client_id(), Some(&id)).await?;
        }
        self.tx.update(client).await
    }

    async fn add_scope_mapping(&self, realm_id: &str, id: &str, role_id: &str) -> StorageResult<()> {
        modify(&self.tx, realm_id, id, |c: &mut ClientEntity| c.add_scope_mapping(role_id)).await
    }

    async fn remove_scope_mapping(&self, realm_id: &str, id: &str, role_id: &str) -> StorageResult<bool> {
        modify(&self.tx, realm_id, id, |c: &mut ClientEntity| c.remove_scope_mapping(role_id)).await
    }

    async fn remove_client(&self, realm_id: &str, id: &str) -> StorageResult<bool> {
        if read_in_realm(&self.tx, realm_id, id).await?.is_none() {
            return Ok(false);
        }
        let event = RemovalEvent::before(EntityType::Client, realm_id, id);
        dispatch(&self.events, event.clone()).await?;
        self.tx.set_realm_id(Some(realm_id));
        self.tx.delete(id).await?;
        dispatch(&self.events, event.into_after()).await?;
        Ok(true)
    }

    async fn remove_clients(&self, realm_id: &str) -> StorageResult<u64> {
        self.tx.set_realm_id(Some(realm_id));
        self.tx.delete_matching(&in_realm(realm_id).into()).await
    }

    async fn remove_role_references(&self, realm_id: &str, role_id: &str) -> StorageResult<u64> {
        let query = in_realm(realm_id).compare(ClientField::ScopeMappingRole, Operator::Eq, role_id);
        let mut changed = 0;
        for mut client in self.select(realm_id, query.into()).await? {
            if client.remove_scope_mapping(role_id) {
                self.tx.update(client).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }
}
