//! # kc-spi
//!
//! Root context and request-scoped sessions.
//!
//! - [`KeycloakSessionFactory`] is built once per process. It owns the
//!   configuration, the clock, the [`StorageTable`] binding each entity type
//!   to one backend, the cluster coordinator and the removal cascade.
//! - [`KeycloakSession`] is one unit of work. It creates providers lazily,
//!   enlists their transactions, and runs the cascade for every removal its
//!   providers raise.
//!
//! ```ignore
//! let factory = KeycloakSessionFactory::new(config, clock, cluster).await?;
//! factory
//!     .run_in_transaction(|session| Box::pin(async move {
//!         session.realms().await?.create_realm(None, "acme").await
//!     }))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod factory;
pub mod registry;
pub mod session;

pub use factory::{KeycloakSessionFactory, SessionCascade};
pub use registry::StorageTable;
pub use session::KeycloakSession;
