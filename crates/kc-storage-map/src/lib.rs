//! # kc-storage-map
//!
//! In-process storage backends and the providers built on the generic
//! storage contract.
//!
//! - [`ConcurrentHashMapStorage`] keeps one concurrent map per entity type.
//! - [`RealmPartitionedStorage`] keeps one such map per realm.
//! - [`snapshot`] exports and imports map contents as JSON.
//!
//! The `Map*Provider` types implement the domain provider traits on top of a
//! [`kc_storage::MapTransaction`], so they work with any backend.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod chm;
pub mod client;
pub mod group;
pub mod partitioned;
pub mod realm;
pub mod role;
pub mod snapshot;
pub mod user;

mod support;
#[cfg(test)]
mod testing;

pub use chm::ConcurrentHashMapStorage;
pub use client::MapClientProvider;
pub use group::MapGroupProvider;
pub use partitioned::RealmPartitionedStorage;
pub use realm::MapRealmProvider;
pub use role::MapRoleProvider;
pub use snapshot::SnapshotFormat;
pub use user::MapUserProvider;
