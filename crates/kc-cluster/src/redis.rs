//! Redis-backed leases and events.
//!
//! Leases are plain keys claimed with `SET NX EX` and released through a
//! compare-and-delete script. Events travel over one pub/sub channel per key
//! prefix; the subscriber connection feeds a local broadcast channel.

use std::fmt;

use async_trait::async_trait;
use fred::clients::SubscriberClient;
use fred::prelude::*;
use fred::types::Builder;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{from_redis_error, ClusterError, ClusterResult};
use crate::event::{self, Envelope, EventBus};
use crate::lease::LeaseStore;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

fn reconnect_policy() -> ReconnectPolicy {
    ReconnectPolicy::new_exponential(0, 1000, 30_000, 2)
}

fn client_config(url: &str) -> ClusterResult<Config> {
    Config::from_url(url).map_err(|e| ClusterError::Configuration(e.to_string()))
}

/// Safely convert seconds to i64 for Redis expiration.
#[allow(clippy::cast_possible_wrap)]
const fn seconds_to_i64(seconds: u64) -> i64 {
    seconds as i64
}

/// Lease store on a Redis server.
pub struct RedisLeaseStore {
    client: Client,
    prefix: String,
}

impl fmt::Debug for RedisLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLeaseStore").field("prefix", &self.prefix).finish_non_exhaustive()
    }
}

impl RedisLeaseStore {
    /// Connects to `url`; every lease key is prefixed with `<prefix>:lease:`.
    ///
    /// ## Errors
    ///
    /// Returns an error if the URL is invalid or the server unreachable.
    pub async fn connect(url: &str, prefix: &str) -> ClusterResult<Self> {
        let client = Client::new(client_config(url)?, None, None, Some(reconnect_policy()));
        client.init().await.map_err(from_redis_error)?;
        Ok(Self {
            client,
            prefix: format!("{prefix}:lease:"),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl_secs: u64) -> ClusterResult<bool> {
        let result: Option<String> = self
            .client
            .set(
                self.key(key),
                token,
                Some(Expiration::EX(seconds_to_i64(ttl_secs.max(1)))),
                Some(SetOptions::NX),
                false,
            )
            .await
            .map_err(from_redis_error)?;
        Ok(result.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> ClusterResult<bool> {
        let deleted: i64 = self
            .client
            .eval(RELEASE_SCRIPT, vec![self.key(key)], vec![token.to_string()])
            .await
            .map_err(from_redis_error)?;
        Ok(deleted > 0)
    }
}

/// Event bus over Redis pub/sub.
pub struct RedisEventBus {
    publisher: Client,
    subscriber: SubscriberClient,
    channel: String,
    sender: broadcast::Sender<Envelope>,
    pump: JoinHandle<()>,
}

impl fmt::Debug for RedisEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEventBus").field("channel", &self.channel).finish_non_exhaustive()
    }
}

impl RedisEventBus {
    /// Connects to `url` and subscribes to the `<prefix>:cluster` channel.
    ///
    /// ## Errors
    ///
    /// Returns an error if the URL is invalid or the server unreachable.
    pub async fn connect(url: &str, prefix: &str) -> ClusterResult<Self> {
        let config = client_config(url)?;
        let publisher = Client::new(config.clone(), None, None, Some(reconnect_policy()));
        publisher.init().await.map_err(from_redis_error)?;

        let subscriber = Builder::from_config(config)
            .set_policy(reconnect_policy())
            .build_subscriber_client()
            .map_err(from_redis_error)?;
        subscriber.init().await.map_err(from_redis_error)?;
        // Re-subscribe after reconnects.
        let _resubscribe = subscriber.manage_subscriptions();

        let channel = format!("{prefix}:cluster");
        let (sender, _) = event::channel();
        let mut messages = subscriber.message_rx();
        let forward = sender.clone();
        let pump = tokio::spawn(async move {
            while let Ok(message) = messages.recv().await {
                let Some(text) = message.value.as_string() else {
                    continue;
                };
                match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => {
                        let _ = forward.send(envelope);
                    }
                    Err(err) => tracing::warn!(error = %err, "Dropping undecodable cluster event"),
                }
            }
        });
        subscriber
            .subscribe(channel.clone())
            .await
            .map_err(from_redis_error)?;

        Ok(Self {
            publisher,
            subscriber,
            channel,
            sender,
            pump,
        })
    }

    /// Closes both connections.
    ///
    /// ## Errors
    ///
    /// Returns an error if the server rejects the unsubscribe.
    pub async fn shutdown(&self) -> ClusterResult<()> {
        self.subscriber
            .unsubscribe(self.channel.clone())
            .await
            .map_err(from_redis_error)?;
        self.pump.abort();
        let _ = self.subscriber.quit().await;
        let _ = self.publisher.quit().await;
        Ok(())
    }
}

impl Drop for RedisEventBus {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, envelope: &Envelope) -> ClusterResult<()> {
        let payload = serde_json::to_string(envelope)?;
        self.publisher
            .publish::<(), _, _>(self.channel.clone(), payload)
            .await
            .map_err(from_redis_error)
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use testcontainers::runners::AsyncRunner;
    use testcontainers_modules::redis::Redis;

    use super::*;
    use crate::event::{ClusterEvent, DcScope};

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn leases_and_events_over_redis() -> anyhow::Result<()> {
        let node = Redis::default().start().await?;
        let url = format!("redis://127.0.0.1:{}", node.get_host_port_ipv4(6379).await?);

        let leases = RedisLeaseStore::connect(&url, "kc-test").await?;
        assert!(leases.try_acquire("k", "a", 30).await?);
        assert!(!leases.try_acquire("k", "b", 30).await?);
        assert!(!leases.release("k", "b").await?);
        assert!(leases.release("k", "a").await?);

        let bus = RedisEventBus::connect(&url, "kc-test").await?;
        let mut rx = bus.subscribe();
        let envelope = Envelope {
            topic: "t".into(),
            origin_node: "n1".into(),
            origin_site: None,
            scope: DcScope::AllDcs,
            event: ClusterEvent {
                kind: "k".into(),
                payload: serde_json::json!({"n": 1}),
            },
        };
        bus.publish(&envelope).await?;
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await??;
        assert_eq!(received, envelope);
        bus.shutdown().await?;
        Ok(())
    }
}
