//! # kc-storage
//!
//! The storage contract shared by every backend.
//!
//! - [`Criteria`] and [`QueryParameters`] describe a search independently of
//!   any query language.
//! - [`MapStorage`] is the backend contract; one instance stores one entity
//!   type.
//! - [`MapTransaction`] is the only path from a provider to a backend. It
//!   buffers writes, merges them into reads and applies them on commit.
//! - [`TransactionManager`] drives every transaction of a session together.
//! - [`CascadeRegistry`] holds the ordered cleanup hooks run when an entity
//!   is removed.
//!
//! ## Provider Traits
//!
//! - [`RealmProvider`] - realms
//! - [`ClientProvider`] - clients and scope mappings
//! - [`GroupProvider`] - group hierarchy and role grants
//! - [`RoleProvider`] - realm and client roles, composites
//! - [`UserProvider`] - users and their owned children

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod cascade;
pub mod client;
pub mod criteria;
pub mod error;
pub mod group;
pub mod manager;
pub mod query;
pub mod realm;
pub mod role;
pub mod transaction;
pub mod user;

pub use backend::{EntityStream, KeyGenerator, MapStorage};
pub use cascade::{CascadeRegistry, InvalidationSink};
pub use client::ClientProvider;
pub use criteria::{Comparison, Criteria, Criterion, LikePattern, Operator};
pub use error::{StorageError, StorageResult};
pub use group::GroupProvider;
pub use manager::{EnlistPhase, StorageTransaction, TransactionManager};
pub use query::{Order, OrderBy, QueryParameters};
pub use realm::RealmProvider;
pub use role::RoleProvider;
pub use transaction::MapTransaction;
pub use user::{UserProvider, UserSearch};
