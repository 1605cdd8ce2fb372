//! Entity contract and change tracking.
//!
//! Every stored record embeds an [`EntityMeta`] carrying its identity, owning
//! realm, version, free-form attributes and the dirty marker. Setters route
//! through [`set_tracked`] so that only real changes mark the entity dirty.

use std::collections::HashMap;
use std::fmt::Debug;

use kc_core::EntityType;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// Identity, scope and change-tracking state shared by all entities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    realm_id: Option<String>,
    #[serde(default)]
    version: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    attributes: HashMap<String, Vec<String>>,
    #[serde(skip)]
    updated: bool,
}

// The dirty marker is bookkeeping, not state.
impl PartialEq for EntityMeta {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.realm_id == other.realm_id
            && self.version == other.version
            && self.attributes == other.attributes
    }
}

impl Eq for EntityMeta {}

impl EntityMeta {
    /// Whether this record itself changed since the last durable write.
    #[must_use]
    pub const fn is_updated(&self) -> bool {
        self.updated
    }

    /// Marks this record as changed.
    pub fn mark_updated(&mut self) {
        self.updated = true;
    }

    /// Version bumped by the backend on every durable update.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Sets the stored version. Backends only.
    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Drops the identity so the record can be stored as a new entity.
    pub fn reset_identity(&mut self, id: Option<String>) {
        self.id = id;
        self.version = 0;
        self.updated = true;
    }
}

/// Dirty marker for records owned by an entity.
///
/// Compares equal to any other marker, so two records with the same data are
/// equal whatever their write state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeMarker(bool);

impl PartialEq for ChangeMarker {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Eq for ChangeMarker {}

impl ChangeMarker {
    /// A set marker.
    #[must_use]
    pub const fn marked() -> Self {
        Self(true)
    }

    /// Whether the record changed since the last write.
    #[must_use]
    pub const fn is_marked(self) -> bool {
        self.0
    }

    /// Sets the marker.
    pub fn mark(&mut self) {
        self.0 = true;
    }

    /// Clears the marker.
    pub fn clear(&mut self) {
        self.0 = false;
    }
}

/// Assigns `value` to `field`, marking `meta` updated only on change.
pub fn set_tracked<T: PartialEq>(meta: &mut EntityMeta, field: &mut T, value: T) {
    if *field != value {
        *field = value;
        meta.updated = true;
    }
}

/// A stored record.
///
/// Implementors own all their data (no shared interior mutability), so a
/// `clone` is always a deep, independent copy.
pub trait Entity: Clone + Default + Debug + Send + Sync + 'static {
    /// Type tag used for backend routing and error reporting.
    const ENTITY_TYPE: EntityType;

    /// Whether instances carry an expiration time.
    const EXPIRABLE: bool = false;

    /// Shared metadata.
    fn meta(&self) -> &EntityMeta;

    /// Shared metadata, mutable.
    fn meta_mut(&mut self) -> &mut EntityMeta;

    /// The entity id, once assigned.
    fn id(&self) -> Option<&str> {
        self.meta().id.as_deref()
    }

    /// Assigns the id.
    ///
    /// ## Errors
    ///
    /// Returns [`ModelError::IdAlreadyAssigned`] if a different id is already
    /// set, or [`ModelError::EmptyId`] for an empty id.
    fn set_id(&mut self, id: &str) -> ModelResult<()> {
        if id.is_empty() {
            return Err(ModelError::EmptyId(Self::ENTITY_TYPE));
        }
        match self.meta().id.as_deref() {
            Some(existing) if existing == id => Ok(()),
            Some(existing) => Err(ModelError::IdAlreadyAssigned {
                entity_type: Self::ENTITY_TYPE,
                existing: existing.to_string(),
                attempted: id.to_string(),
            }),
            None => {
                let meta = self.meta_mut();
                meta.id = Some(id.to_string());
                meta.updated = true;
                Ok(())
            }
        }
    }

    /// Owning realm.
    fn realm_id(&self) -> Option<&str> {
        self.meta().realm_id.as_deref()
    }

    /// Sets the owning realm.
    fn set_realm_id(&mut self, realm_id: &str) {
        let meta = self.meta_mut();
        if meta.realm_id.as_deref() != Some(realm_id) {
            meta.realm_id = Some(realm_id.to_string());
            meta.updated = true;
        }
    }

    /// Stored version.
    fn version(&self) -> u64 {
        self.meta().version
    }

    /// True if this entity or any owned child changed.
    fn is_dirty(&self) -> bool {
        self.meta().updated || self.children_dirty()
    }

    /// True if any owned child changed.
    fn children_dirty(&self) -> bool {
        false
    }

    /// Clears the dirty marker on this entity and every owned child.
    ///
    /// Backends call this only after a successful durable write.
    fn clear_dirty(&mut self) {
        self.meta_mut().updated = false;
        self.clear_children_dirty();
    }

    /// Clears the dirty marker on owned children.
    fn clear_children_dirty(&mut self) {}

    /// Expiration time in epoch milliseconds, if any.
    fn expiration(&self) -> Option<i64> {
        None
    }

    /// True once `now_millis` has reached the expiration time.
    fn is_expired(&self, now_millis: i64) -> bool {
        self.expiration().is_some_and(|exp| exp <= now_millis)
    }

    /// All attributes.
    fn attributes(&self) -> &HashMap<String, Vec<String>> {
        &self.meta().attributes
    }

    /// Values of one attribute; empty when absent.
    fn attribute(&self, name: &str) -> &[String] {
        self.meta()
            .attributes
            .get(name)
            .map_or(&[][..], Vec::as_slice)
    }

    /// First value of one attribute.
    fn first_attribute(&self, name: &str) -> Option<&str> {
        self.attribute(name).first().map(String::as_str)
    }

    /// Replaces the values of an attribute. An empty list removes it.
    fn set_attribute(&mut self, name: &str, values: Vec<String>) {
        if values.is_empty() {
            self.remove_attribute(name);
            return;
        }
        let meta = self.meta_mut();
        if meta.attributes.get(name) != Some(&values) {
            meta.attributes.insert(name.to_string(), values);
            meta.updated = true;
        }
    }

    /// Replaces the values of an attribute with a single value.
    fn set_single_attribute(&mut self, name: &str, value: &str) {
        self.set_attribute(name, vec![value.to_string()]);
    }

    /// Appends a value to an attribute.
    fn add_attribute_value(&mut self, name: &str, value: &str) {
        let meta = self.meta_mut();
        meta.attributes
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
        meta.updated = true;
    }

    /// Removes an attribute.
    fn remove_attribute(&mut self, name: &str) {
        let meta = self.meta_mut();
        if meta.attributes.remove(name).is_some() {
            meta.updated = true;
        }
    }
}
