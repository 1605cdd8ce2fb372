//! # kc-core
//!
//! Configuration, error handling, time source and removal events shared by
//! every crate of the Keycloak storage core.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod time;
pub mod types;

pub use config::{BackendKind, Config, KeyType};
pub use error::{Error, Result};
pub use event::{RemovalEvent, RemovalPhase};
pub use time::{Clock, SystemClock, VirtualClock};
pub use types::EntityType;
