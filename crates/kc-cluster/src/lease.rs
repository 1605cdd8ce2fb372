//! Time-bounded exclusive claims on coordination keys.
//!
//! A lease is held by an opaque token until it is released by the same token
//! or its TTL runs out. Acquisition is first-acquirer-wins.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use kc_core::Clock;
use parking_lot::Mutex;

use crate::error::ClusterResult;

/// Lease service shared by every node of a cluster.
#[async_trait]
pub trait LeaseStore: Debug + Send + Sync {
    /// Claims `key` for `ttl_secs` unless a live lease exists.
    ///
    /// ## Errors
    ///
    /// Returns `ClusterError::CoordinationFailure` if the service is
    /// unreachable.
    async fn try_acquire(&self, key: &str, token: &str, ttl_secs: u64) -> ClusterResult<bool>;

    /// Drops the lease on `key` if `token` still holds it.
    ///
    /// ## Errors
    ///
    /// Returns `ClusterError::CoordinationFailure` if the service is
    /// unreachable.
    async fn release(&self, key: &str, token: &str) -> ClusterResult<bool>;
}

#[derive(Debug, Clone)]
struct Lease {
    token: String,
    expires_at: i64,
}

/// In-process lease store.
///
/// Nodes simulated within one process share a single instance. Expiry is
/// checked against the injected clock.
#[derive(Debug)]
pub struct InMemoryLeaseStore {
    clock: Arc<dyn Clock>,
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLeaseStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Token currently holding `key`, if the lease is live.
    #[must_use]
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = self.clock.now_millis();
        self.leases
            .lock()
            .get(key)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.token.clone())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl_secs: u64) -> ClusterResult<bool> {
        let now = self.clock.now_millis();
        let ttl_millis = i64::try_from(ttl_secs.max(1)).unwrap_or(i64::MAX / 1000).saturating_mul(1000);
        let mut leases = self.leases.lock();
        if leases.get(key).is_some_and(|lease| lease.expires_at > now) {
            return Ok(false);
        }
        leases.insert(
            key.to_string(),
            Lease {
                token: token.to_string(),
                expires_at: now.saturating_add(ttl_millis),
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> ClusterResult<bool> {
        let mut leases = self.leases.lock();
        if leases.get(key).is_some_and(|lease| lease.token == token) {
            leases.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}
