//! End-to-end tests over the root context.
//!
//! Everything runs on in-memory backends with a virtual clock, except the
//! container tests, which need Docker and are ignored by default.

mod cascade;
mod cluster;
mod common;
mod containers;
mod sessions;
mod storage;
