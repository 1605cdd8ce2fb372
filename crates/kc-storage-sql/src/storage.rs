//! `PostgreSQL` document backend.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::StreamExt;
use kc_core::KeyType;
use kc_model::SearchableEntity;
use kc_storage::{EntityStream, KeyGenerator, MapStorage, QueryParameters, StorageError, StorageResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::error::{from_sqlx_error, query_error};
use crate::schema;
use crate::translate::{push_filter, push_order_and_page};

type DocumentRow = (Json<serde_json::Value>, i64);

/// Stores one entity type as JSONB documents in `kc_entity`.
pub struct PgMapStorage<E> {
    pool: PgPool,
    keys: KeyGenerator,
    _entity: PhantomData<fn() -> E>,
}

impl<E: SearchableEntity> fmt::Debug for PgMapStorage<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgMapStorage")
            .field("entity_type", &E::ENTITY_TYPE)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

fn to_version(version: u64) -> StorageResult<i64> {
    i64::try_from(version).map_err(|_| StorageError::InvalidData(format!("version {version} out of range")))
}

impl<E> PgMapStorage<E>
where
    E: SearchableEntity + Serialize + DeserializeOwned,
{
    /// Creates a backend over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool, key_type: KeyType) -> Self {
        Self {
            pool,
            keys: KeyGenerator::for_type(key_type),
            _entity: PhantomData,
        }
    }

    /// The pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn type_name() -> &'static str {
        E::ENTITY_TYPE.as_str()
    }

    fn document(entity: &E) -> StorageResult<serde_json::Value> {
        serde_json::to_value(entity).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn from_row((Json(data), version): DocumentRow) -> StorageResult<E> {
        let mut entity: E =
            serde_json::from_value(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
        entity
            .meta_mut()
            .set_version(u64::try_from(version).unwrap_or_default());
        entity.clear_dirty();
        Ok(entity)
    }

    fn require_id(entity: &E, action: &str) -> StorageResult<String> {
        entity
            .id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::InvalidData(format!("{} {action} without id", E::ENTITY_TYPE)))
    }
}

#[async_trait]
impl<E> MapStorage<E> for PgMapStorage<E>
where
    E: SearchableEntity + Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn new_key(&self) -> String {
        self.keys.next_key()
    }

    async fn create(&self, _realm_id: Option<&str>, mut entity: E) -> StorageResult<E> {
        let id = Self::require_id(&entity, "create")?;
        sqlx::query(
            "INSERT INTO kc_entity (entity_type, id, realm_id, version, data) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Self::type_name())
        .bind(&id)
        .bind(entity.realm_id())
        .bind(to_version(entity.version())?)
        .bind(Json(Self::document(&entity)?))
        .execute(&self.pool)
        .await
        .map_err(|e| from_sqlx_error(e, Some((E::ENTITY_TYPE, &id))))?;
        entity.clear_dirty();
        Ok(entity)
    }

    async fn read(&self, _realm_id: Option<&str>, id: &str) -> StorageResult<Option<E>> {
        sqlx::query_as::<_, DocumentRow>("SELECT data, version FROM kc_entity WHERE entity_type = $1 AND id = $2")
            .bind(Self::type_name())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?
            .map(Self::from_row)
            .transpose()
    }

    async fn read_matching(
        &self,
        _realm_id: Option<&str>,
        query: &QueryParameters<E::Field>,
    ) -> StorageResult<EntityStream<E>> {
        query.criteria().validate()?;
        let mut qb = QueryBuilder::<Postgres>::new("SELECT data, version FROM kc_entity");
        push_filter(&mut qb, Self::type_name(), query);
        push_order_and_page(&mut qb, query);
        tracing::trace!(entity_type = %E::ENTITY_TYPE, sql = qb.sql(), "Querying documents");

        let rows: Vec<DocumentRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(futures::stream::iter(rows.into_iter().map(Self::from_row)).boxed())
    }

    async fn update(&self, _realm_id: Option<&str>, mut entity: E) -> StorageResult<Option<E>> {
        let id = Self::require_id(&entity, "update")?;
        let mut tx = self.pool.begin().await.map_err(query_error)?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT version FROM kc_entity WHERE entity_type = $1 AND id = $2 FOR UPDATE")
                .bind(Self::type_name())
                .bind(&id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| from_sqlx_error(e, Some((E::ENTITY_TYPE, &id))))?;
        let Some(current) = current else {
            return Ok(None);
        };
        let actual = u64::try_from(current).unwrap_or_default();
        if actual != entity.version() {
            return Err(StorageError::VersionConflict {
                entity_type: E::ENTITY_TYPE,
                id,
                expected: entity.version(),
                actual,
            });
        }

        let next = actual + 1;
        entity.meta_mut().set_version(next);
        sqlx::query("UPDATE kc_entity SET version = $3, realm_id = $4, data = $5 WHERE entity_type = $1 AND id = $2")
            .bind(Self::type_name())
            .bind(&id)
            .bind(to_version(next)?)
            .bind(entity.realm_id())
            .bind(Json(Self::document(&entity)?))
            .execute(&mut *tx)
            .await
            .map_err(|e| from_sqlx_error(e, Some((E::ENTITY_TYPE, &id))))?;
        tx.commit().await.map_err(query_error)?;

        entity.clear_dirty();
        Ok(Some(entity))
    }

    async fn delete(&self, _realm_id: Option<&str>, id: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM kc_entity WHERE entity_type = $1 AND id = $2")
            .bind(Self::type_name())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| from_sqlx_error(e, Some((E::ENTITY_TYPE, id))))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_matching(
        &self,
        _realm_id: Option<&str>,
        query: &QueryParameters<E::Field>,
    ) -> StorageResult<u64> {
        query.criteria().validate()?;
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM kc_entity");
        push_filter(&mut qb, Self::type_name(), query);
        let result = qb.build().execute(&self.pool).await.map_err(query_error)?;
        Ok(result.rows_affected())
    }

    async fn count(&self, _realm_id: Option<&str>, query: &QueryParameters<E::Field>) -> StorageResult<u64> {
        query.criteria().validate()?;
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM kc_entity");
        push_filter(&mut qb, Self::type_name(), query);
        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn exists(&self, _realm_id: Option<&str>, id: &str) -> StorageResult<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM kc_entity WHERE entity_type = $1 AND id = $2)")
            .bind(Self::type_name())
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(query_error)
    }

    async fn check_consistency(&self) -> StorageResult<()> {
        schema::check_consistency(&self.pool).await
    }
}
