//! Backend contract through a transaction: ids, round trips, criteria and
//! paging on every in-memory backend.

use std::sync::Arc;

use kc_core::{Clock, KeyType, VirtualClock};
use kc_model::{Entity, UserEntity, UserField};
use kc_storage::{Criteria, MapStorage, MapTransaction, Operator, Order, QueryParameters, StorageTransaction};
use kc_storage_map::{ConcurrentHashMapStorage, RealmPartitionedStorage};

use crate::common::T0;

const REALM: &str = "r";

struct Backend {
    storage: Arc<dyn MapStorage<UserEntity>>,
    clock: Arc<dyn Clock>,
}

impl Backend {
    fn all() -> Vec<Self> {
        let clock: Arc<dyn Clock> = Arc::new(VirtualClock::starting_at(T0));
        vec![
            Self {
                storage: Arc::new(ConcurrentHashMapStorage::<UserEntity>::new(KeyType::Uuid)),
                clock: Arc::clone(&clock),
            },
            Self {
                storage: Arc::new(RealmPartitionedStorage::<UserEntity>::new(KeyType::Uuid)),
                clock,
            },
        ]
    }

    fn name(&self) -> &'static str {
        self.storage.name()
    }

    async fn tx(&self) -> anyhow::Result<MapTransaction<UserEntity>> {
        let tx = MapTransaction::new(Arc::clone(&self.storage), Arc::clone(&self.clock));
        tx.set_realm_id(Some(REALM));
        tx.begin().await?;
        Ok(tx)
    }

    /// Stores `users` in one committed transaction.
    async fn seed(&self, users: impl IntoIterator<Item = UserEntity>) -> anyhow::Result<Vec<UserEntity>> {
        let tx = self.tx().await?;
        let mut created = Vec::new();
        for user in users {
            created.push(tx.create(user).await?);
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn usernames(&self, query: &QueryParameters<UserField>) -> anyhow::Result<Vec<String>> {
        let users = self.tx().await?.read_all(query).await?;
        Ok(users.iter().map(|u| u.username().to_string()).collect())
    }
}

fn user(username: &str, dept: &str) -> UserEntity {
    let mut user = UserEntity::new(REALM, username, T0);
    user.set_single_attribute("dept", dept);
    user
}

#[tokio::test]
async fn create_assigns_unique_ids_and_rejects_duplicates() -> anyhow::Result<()> {
    for backend in Backend::all() {
        let created = backend.seed([user("alice", "eng"), user("bob", "eng")]).await?;
        let ids: Vec<_> = created.iter().filter_map(|u| u.id()).collect();
        assert_eq!(ids.len(), 2, "{}", backend.name());
        assert!(ids.iter().all(|id| !id.is_empty()));
        assert_ne!(ids[0], ids[1], "{}", backend.name());

        let mut clash = user("carol", "eng");
        clash.set_id(ids[0])?;
        let err = backend.tx().await?.create(clash).await.unwrap_err();
        assert!(err.is_duplicate(), "{}: {err}", backend.name());
    }
    Ok(())
}

#[tokio::test]
async fn read_returns_what_was_created() -> anyhow::Result<()> {
    for backend in Backend::all() {
        let mut entity = user("alice", "eng");
        entity.set_email(Some("alice@example.com"));
        entity.set_first_name(Some("Alice".to_string()));
        entity.grant_role("role-1");
        entity.join_group("group-1");
        let created = backend.seed([entity]).await?.remove(0);
        let id = created.id().unwrap_or_default().to_string();

        let read = backend.tx().await?.read(&id).await?;
        assert_eq!(read.as_ref(), Some(&created), "{}", backend.name());
    }
    Ok(())
}

#[tokio::test]
async fn criteria_select_exactly_the_matches() -> anyhow::Result<()> {
    for backend in Backend::all() {
        backend.seed([user("id1", "eng"), user("id2", "sales")]).await?;

        let eq = QueryParameters::with_criteria(Criteria::new().compare_keyed(
            UserField::Attribute,
            "dept",
            Operator::Eq,
            "eng",
        ));
        assert_eq!(backend.usernames(&eq).await?, vec!["id1"], "{}", backend.name());

        let ilike = QueryParameters::with_criteria(Criteria::new().compare_keyed(
            UserField::Attribute,
            "dept",
            Operator::ILike,
            "%AL%",
        ));
        assert_eq!(backend.usernames(&ilike).await?, vec!["id2"], "{}", backend.name());
    }
    Ok(())
}

#[tokio::test]
async fn ordered_page_is_exact() -> anyhow::Result<()> {
    for backend in Backend::all() {
        let names = ["h", "c", "j", "a", "e", "b", "i", "d", "g", "f"];
        backend.seed(names.map(|n| user(n, "eng"))).await?;

        let page = QueryParameters::with_criteria(Criteria::new())
            .order_by(UserField::Username, Order::Ascending)
            .pagination(Some(3), Some(4));
        assert_eq!(backend.usernames(&page).await?, vec!["d", "e", "f", "g"], "{}", backend.name());
        assert_eq!(backend.tx().await?.count(&page.without_pagination()).await?, 10);
    }
    Ok(())
}

#[tokio::test]
async fn uncommitted_writes_stay_private() -> anyhow::Result<()> {
    for backend in Backend::all() {
        let writer = backend.tx().await?;
        let created = writer.create(user("alice", "eng")).await?;
        let id = created.id().unwrap_or_default().to_string();

        assert!(backend.tx().await?.read(&id).await?.is_none(), "{}", backend.name());
        writer.rollback().await?;
        assert!(backend.tx().await?.read(&id).await?.is_none(), "{}", backend.name());
    }
    Ok(())
}
