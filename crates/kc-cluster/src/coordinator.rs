//! Single-flight execution and cross-node notification.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use kc_core::config::ClusterConfig;
use kc_core::Clock;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::ClusterResult;
use crate::event::{ClusterEvent, DcScope, Envelope, EventBus, EventPayload, InMemoryEventBus};
use crate::lease::{InMemoryLeaseStore, LeaseStore};
use crate::redis::{RedisEventBus, RedisLeaseStore};

/// Outcome of [`ClusterCoordinator::execute_if_not_executed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult<T> {
    executed: bool,
    result: Option<T>,
}

impl<T> ExecutionResult<T> {
    /// The task ran here and produced `result`.
    #[must_use]
    pub const fn executed(result: T) -> Self {
        Self {
            executed: true,
            result: Some(result),
        }
    }

    /// Another node holds the task, or the lease service failed.
    #[must_use]
    pub const fn not_executed() -> Self {
        Self {
            executed: false,
            result: None,
        }
    }

    /// Whether the task ran on this call.
    #[must_use]
    pub const fn is_executed(&self) -> bool {
        self.executed
    }

    /// The task's result, if it ran.
    #[must_use]
    pub fn into_result(self) -> Option<T> {
        self.result
    }
}

type Listener = Arc<dyn Fn(&ClusterEvent) + Send + Sync>;

/// Per-node cluster coordinator.
///
/// Nodes sharing a [`LeaseStore`] agree on who runs a keyed task; nodes
/// sharing an [`EventBus`] see each other's notifications. A node dispatches
/// its own notifications locally and ignores its own envelopes on the bus.
pub struct ClusterCoordinator {
    node_id: String,
    site: Option<String>,
    leases: Arc<dyn LeaseStore>,
    bus: Arc<dyn EventBus>,
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ClusterCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCoordinator")
            .field("node_id", &self.node_id)
            .field("site", &self.site)
            .field("leases", &self.leases)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl ClusterCoordinator {
    /// Creates a coordinator and starts receiving events from `bus`.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        site: Option<String>,
        leases: Arc<dyn LeaseStore>,
        bus: Arc<dyn EventBus>,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            node_id: node_id.into(),
            site,
            leases,
            bus,
            listeners: RwLock::new(HashMap::new()),
            pump: Mutex::new(None),
        });
        let pump = tokio::spawn(Self::pump(Arc::downgrade(&coordinator), coordinator.bus.subscribe()));
        *coordinator.pump.lock() = Some(pump);
        coordinator
    }

    /// A coordinator with in-process leases and events, for a single node.
    #[must_use]
    pub fn standalone(node_id: impl Into<String>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::new(
            node_id,
            None,
            Arc::new(InMemoryLeaseStore::new(clock)),
            Arc::new(InMemoryEventBus::new()),
        )
    }

    /// Builds the coordinator described by `config`: Redis transport when a
    /// URL is set, in-process otherwise.
    ///
    /// ## Errors
    ///
    /// Returns an error if Redis is configured but unreachable.
    pub async fn from_config(config: &ClusterConfig, clock: Arc<dyn Clock>) -> ClusterResult<Arc<Self>> {
        let Some(url) = config.redis_url.as_deref() else {
            tracing::info!(node_id = %config.node_id, "Using in-process cluster coordination");
            return Ok(Self::standalone(config.node_id.clone(), clock));
        };
        let leases = RedisLeaseStore::connect(url, &config.key_prefix).await?;
        let bus = RedisEventBus::connect(url, &config.key_prefix).await?;
        tracing::info!(node_id = %config.node_id, site = ?config.site, "Using Redis cluster coordination");
        Ok(Self::new(
            config.node_id.clone(),
            config.site.clone(),
            Arc::new(leases),
            Arc::new(bus),
        ))
    }

    /// This node's name.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// This node's datacenter.
    #[must_use]
    pub fn site(&self) -> Option<&str> {
        self.site.as_deref()
    }

    /// Runs `task` unless another caller holds `task_key`.
    ///
    /// The claim lasts `timeout_secs`; after that it is assumed stale and may
    /// be taken by another node even if `task` is still running. It is
    /// released as soon as `task` completes. When the lease service fails,
    /// the task is skipped.
    pub async fn execute_if_not_executed<T, F, Fut>(
        &self,
        task_key: &str,
        timeout_secs: u64,
        task: F,
    ) -> ExecutionResult<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
        T: Send,
    {
        let token = format!("{}:{}", self.node_id, Uuid::new_v4());
        match self.leases.try_acquire(task_key, &token, timeout_secs).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(task_key, node_id = %self.node_id, "Task already running elsewhere, skipped");
                return ExecutionResult::not_executed();
            }
            Err(err) => {
                tracing::warn!(task_key, error = %err, "Lease service unavailable, task skipped");
                return ExecutionResult::not_executed();
            }
        }

        tracing::trace!(task_key, node_id = %self.node_id, "Executing task");
        let result = task().await;
        if let Err(err) = self.leases.release(task_key, &token).await {
            tracing::warn!(task_key, error = %err, "Failed to release lease, it will time out");
        }
        ExecutionResult::executed(result)
    }

    /// Registers a listener for every event on `topic`.
    pub fn register_listener<F>(&self, topic: impl Into<String>, listener: F)
    where
        F: Fn(&ClusterEvent) + Send + Sync + 'static,
    {
        self.listeners.write().entry(topic.into()).or_default().push(Arc::new(listener));
    }

    /// Registers a listener for `P` payloads on `topic`; other kinds are
    /// skipped.
    pub fn subscribe<P, F>(&self, topic: impl Into<String>, listener: F)
    where
        P: EventPayload,
        F: Fn(P) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let name = topic.clone();
        self.register_listener(topic, move |event| match event.decode::<P>() {
            Ok(Some(payload)) => listener(payload),
            Ok(None) => {}
            Err(err) => tracing::warn!(topic = %name, kind = %event.kind, error = %err, "Undecodable cluster event"),
        });
    }

    /// Broadcasts `payload` to listeners of `topic` on this and other nodes.
    ///
    /// With `await_completion` local listeners have run when this returns;
    /// otherwise they run on a spawned task.
    ///
    /// ## Errors
    ///
    /// Returns an error if the payload cannot be encoded or the transport
    /// rejects it. Local listeners still run in the latter case.
    pub async fn notify<P: EventPayload>(
        self: &Arc<Self>,
        topic: &str,
        payload: &P,
        await_completion: bool,
        scope: DcScope,
    ) -> ClusterResult<()> {
        let envelope = Envelope {
            topic: topic.to_string(),
            origin_node: self.node_id.clone(),
            origin_site: self.site.clone(),
            scope,
            event: ClusterEvent::encode(payload)?,
        };

        if await_completion {
            self.dispatch(&envelope.topic, &envelope.event);
        } else {
            let this = Arc::clone(self);
            let local = envelope.clone();
            tokio::spawn(async move { this.dispatch(&local.topic, &local.event) });
        }

        self.bus.publish(&envelope).await.map_err(|err| {
            tracing::warn!(topic, error = %err, "Cluster notification not delivered to other nodes");
            err
        })
    }

    /// Stops receiving events from other nodes.
    pub fn shutdown(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    fn dispatch(&self, topic: &str, event: &ClusterEvent) {
        let listeners = self.listeners.read().get(topic).cloned().unwrap_or_default();
        for listener in listeners {
            listener(event);
        }
    }

    async fn pump(this: Weak<Self>, mut rx: tokio::sync::broadcast::Receiver<Envelope>) {
        loop {
            let envelope = match rx.recv().await {
                Ok(envelope) => envelope,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Cluster event receiver lagged, events dropped");
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            let Some(this) = this.upgrade() else {
                return;
            };
            if envelope.origin_node == this.node_id || !envelope.reaches(this.site()) {
                continue;
            }
            tracing::trace!(topic = %envelope.topic, from = %envelope.origin_node, "Received cluster event");
            this.dispatch(&envelope.topic, &envelope.event);
        }
    }
}

impl Drop for ClusterCoordinator {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}
