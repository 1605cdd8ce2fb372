//! Removal events.
//!
//! Fired by domain providers around the deletion of an entity so that every
//! other entity type holding a reference to it can drop that reference.

use serde::{Deserialize, Serialize};

use crate::types::EntityType;

/// When the event fires relative to the deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemovalPhase {
    /// Before the entity is deleted; it is still readable.
    BeforeRemove,
    /// After the entity is deleted.
    AfterRemove,
}

/// An entity is being removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalEvent {
    /// Before or after the delete.
    pub phase: RemovalPhase,
    /// Type of the removed entity.
    pub entity_type: EntityType,
    /// Realm of the removed entity (the realm's own id for realms).
    pub realm_id: String,
    /// Id of the removed entity.
    pub id: String,
    /// Owning container, e.g. the client of a client role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl RemovalEvent {
    /// Creates a before-remove event.
    #[must_use]
    pub fn before(
        entity_type: EntityType,
        realm_id: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            phase: RemovalPhase::BeforeRemove,
            entity_type,
            realm_id: realm_id.into(),
            id: id.into(),
            container_id: None,
        }
    }

    /// Creates an after-remove event.
    #[must_use]
    pub fn after(
        entity_type: EntityType,
        realm_id: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            phase: RemovalPhase::AfterRemove,
            ..Self::before(entity_type, realm_id, id)
        }
    }

    /// Sets the owning container.
    #[must_use]
    pub fn with_container(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    /// The same event in the after-remove phase.
    #[must_use]
    pub fn into_after(mut self) -> Self {
        self.phase = RemovalPhase::AfterRemove;
        self
    }
}
