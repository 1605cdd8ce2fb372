//! Cluster events and their transports.
//!
//! An event is a typed payload published on a topic. Listeners subscribe to
//! topics, never to payload types; the payload carries its own `kind` so a
//! listener can decode what it understands and skip the rest.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ClusterResult;

const BUS_CAPACITY: usize = 1024;

/// Which datacenters an event reaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DcScope {
    /// Nodes of the sender's site.
    #[default]
    LocalDc,
    /// Every node of every site.
    AllDcs,
}

/// A payload that can travel between nodes.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Discriminator stored next to the encoded payload.
    const KIND: &'static str;
}

/// An encoded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    /// Payload discriminator.
    pub kind: String,
    /// Encoded payload.
    pub payload: serde_json::Value,
}

impl ClusterEvent {
    /// Encodes a payload.
    ///
    /// ## Errors
    ///
    /// Returns `ClusterError::Serialization` if the payload cannot be encoded.
    pub fn encode<P: EventPayload>(payload: &P) -> ClusterResult<Self> {
        Ok(Self {
            kind: P::KIND.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decodes the payload if it is a `P`.
    ///
    /// ## Errors
    ///
    /// Returns `ClusterError::Serialization` if the kind matches but the
    /// payload does not decode.
    pub fn decode<P: EventPayload>(&self) -> ClusterResult<Option<P>> {
        if self.kind != P::KIND {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(self.payload.clone())?))
    }
}

/// An event in transit, with its routing information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Listener topic.
    pub topic: String,
    /// Sending node.
    pub origin_node: String,
    /// Sending node's site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_site: Option<String>,
    /// Reach.
    pub scope: DcScope,
    /// The event.
    pub event: ClusterEvent,
}

impl Envelope {
    /// Whether a node at `site` should dispatch this envelope.
    #[must_use]
    pub fn reaches(&self, site: Option<&str>) -> bool {
        match self.scope {
            DcScope::AllDcs => true,
            DcScope::LocalDc => self.origin_site.as_deref() == site,
        }
    }
}

/// Transport carrying envelopes between nodes.
///
/// Delivery is at-least-once; a node also receives its own envelopes.
#[async_trait]
pub trait EventBus: Debug + Send + Sync {
    /// Sends an envelope to every subscribed node.
    ///
    /// ## Errors
    ///
    /// Returns `ClusterError::CoordinationFailure` if the transport is down.
    async fn publish(&self, envelope: &Envelope) -> ClusterResult<()>;

    /// Receives every envelope published after this call.
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;
}

/// In-process bus shared by simulated nodes.
#[derive(Debug, Clone)]
pub struct InMemoryEventBus {
    sender: broadcast::Sender<Envelope>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventBus {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, envelope: &Envelope) -> ClusterResult<()> {
        // No subscribers is not an error: a single node has nobody to tell.
        let _ = self.sender.send(envelope.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}

pub(crate) fn channel() -> (broadcast::Sender<Envelope>, broadcast::Receiver<Envelope>) {
    broadcast::channel(BUS_CAPACITY)
}
