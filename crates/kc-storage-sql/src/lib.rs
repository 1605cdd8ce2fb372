//! # kc-storage-sql
//!
//! `PostgreSQL` storage backend for Keycloak Rust.
//!
//! Entities are stored as JSONB documents in a single table and queried by
//! translating criteria into SQL over the document. Each connection carries
//! a pessimistic `lock_timeout`; updates lock the row and compare versions.
//!
//! ```text
//! create_pool -> migrate -> PgMapStorage::new -> check_consistency
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod pool;
pub mod schema;
pub mod storage;
pub mod translate;

pub use pool::{create_pool, PoolConfig};
pub use schema::{check_consistency, migrate, SCHEMA_VERSION};
pub use storage::PgMapStorage;
