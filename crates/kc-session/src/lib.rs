//! # kc-session
//!
//! User and client session lifecycle for the Keycloak storage core.
//!
//! Sessions are ordinary expirable entities: every read checks the stored
//! expiration against the clock and treats an expired session as absent,
//! deleting it on the way. There is no background state transition; a sweep
//! through [`UserSessionProvider::remove_expired`] only catches sessions no
//! read has touched.
//!
//! ```text
//! Active --(read after expiration)--> Expired --(buffered delete)--> Removed
//!    \--------------(logout / removal)-------------------------------/
//! ```
//!
//! Offline sessions are independent copies linked to their online
//! counterpart through a note; see [`user_session::notes`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client_session;
pub mod error;
pub mod expiration;
pub mod map;
pub mod provider;
pub mod user_session;

pub use client_session::AuthenticatedClientSessionEntity;
pub use error::{SessionError, SessionResult};
pub use expiration::{client_session_expiration, user_session_expiration, Timeouts};
pub use map::MapUserSessionProvider;
pub use provider::UserSessionProvider;
pub use user_session::{PersistenceState, SessionState, UserSessionEntity, UserSessionField};
