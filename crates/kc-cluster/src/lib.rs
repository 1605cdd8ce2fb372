//! # kc-cluster
//!
//! Cluster-wide coordination for the Keycloak storage core.
//!
//! - [`ClusterCoordinator::execute_if_not_executed`] runs a keyed task on at
//!   most one node at a time, backed by a [`LeaseStore`]
//! - [`ClusterCoordinator::notify`] broadcasts typed events over an
//!   [`EventBus`] to listeners registered per topic
//! - [`TimerProvider`] runs named periodic tasks
//! - [`PeriodicSyncManager`] schedules user-storage synchronization on every
//!   node and lets the lease decide which one runs it
//!
//! In-process implementations serve single nodes and tests; the Redis ones
//! (`SET NX EX` leases, pub/sub events) serve real clusters.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod coordinator;
pub mod error;
pub mod event;
pub mod lease;
pub mod redis;
pub mod sync;
pub mod timer;

pub use coordinator::{ClusterCoordinator, ExecutionResult};
pub use error::{ClusterError, ClusterResult};
pub use event::{ClusterEvent, DcScope, Envelope, EventBus, EventPayload, InMemoryEventBus};
pub use lease::{InMemoryLeaseStore, LeaseStore};
pub use redis::{RedisEventBus, RedisLeaseStore};
pub use sync::{
    should_perform_new_sync, ImportSynchronization, PeriodicSyncManager, StorageProviderEvent, StorageProviderModel,
    SyncMode, SyncResult,
};
pub use timer::TimerProvider;
