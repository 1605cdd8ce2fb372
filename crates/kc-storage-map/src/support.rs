//! Helpers shared by the map-backed providers.

use std::sync::Weak;

use kc_core::{EntityType, RemovalEvent};
use kc_model::{RealmEntity, SearchableEntity};
use kc_storage::{InvalidationSink, MapTransaction, RealmProvider, StorageError, StorageResult};

/// Sends a removal event to the owning session.
///
/// ## Errors
///
/// Returns [`StorageError::Transaction`] if the session is gone, or the first
/// failing hook.
pub(crate) async fn dispatch(events: &Weak<dyn InvalidationSink>, event: RemovalEvent) -> StorageResult<()> {
    let Some(sink) = events.upgrade() else {
        return Err(StorageError::Transaction(format!(
            "session closed before {} {} removal events were dispatched",
            event.entity_type, event.id
        )));
    };
    sink.invalidate(event).await
}

/// Loads a realm that must exist.
pub(crate) async fn require_realm(realms: &dyn RealmProvider, realm_id: &str) -> StorageResult<RealmEntity> {
    realms
        .get_realm(realm_id)
        .await?
        .ok_or_else(|| StorageError::not_found(EntityType::Realm, realm_id))
}

/// Reads an entity by id, only if it belongs to `realm_id`.
pub(crate) async fn read_in_realm<E: SearchableEntity>(
    tx: &MapTransaction<E>,
    realm_id: &str,
    id: &str,
) -> StorageResult<Option<E>> {
    tx.set_realm_id(Some(realm_id));
    Ok(tx.read(id).await?.filter(|e| e.realm_id() == Some(realm_id)))
}

/// Reads an entity, applies `change` and buffers the update.
///
/// ## Errors
///
/// Returns [`StorageError::NotFound`] if the entity is not visible in the
/// realm.
pub(crate) async fn modify<E, R, F>(tx: &MapTransaction<E>, realm_id: &str, id: &str, change: F) -> StorageResult<R>
where
    E: SearchableEntity,
    F: FnOnce(&mut E) -> R + Send,
    R: Send,
{
    let mut entity = read_in_realm(tx, realm_id, id)
        .await?
        .ok_or_else(|| StorageError::not_found(E::ENTITY_TYPE, id))?;
    let result = change(&mut entity);
    tx.update(entity).await?;
    Ok(result)
}

/// `%value%` for substring searches.
pub(crate) fn contains(value: &str) -> String {
    format!("%{value}%")
}
