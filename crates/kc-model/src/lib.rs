//! # kc-model
//!
//! Domain entities for the Keycloak storage core.
//!
//! Every entity implements [`Entity`] (identity, realm scope, version,
//! attributes, dirty tracking) and [`SearchableEntity`] (the fields a query
//! may compare). [`DeepCloner`] copies entities across the storage boundary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod cloner;
pub mod credential;
pub mod entity;
pub mod error;
pub mod group;
pub mod realm;
pub mod role;
pub mod searchable;
pub mod user;

pub use client::{ClientEntity, ClientField};
pub use cloner::DeepCloner;
pub use credential::{CredentialEntity, FederatedIdentityEntity, UserConsentEntity};
pub use entity::{set_tracked, ChangeMarker, Entity, EntityMeta};
pub use error::{ModelError, ModelResult};
pub use group::{GroupEntity, GroupField};
pub use kc_core::EntityType;
pub use realm::{RealmEntity, RealmField, SessionSettings};
pub use role::{RoleEntity, RoleField};
pub use searchable::{FieldPath, FieldValue, SearchableEntity, SearchableField, Value};
pub use user::{UserEntity, UserField};
