//! Cluster coordination across simulated nodes sharing one lease store and
//! one event bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kc_cluster::{ClusterCoordinator, DcScope, EventBus, EventPayload, InMemoryEventBus, InMemoryLeaseStore, LeaseStore};
use kc_core::{Clock, VirtualClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::common::T0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RealmRenamed {
    realm_id: String,
}

impl EventPayload for RealmRenamed {
    const KIND: &'static str = "realm-renamed";
}

fn nodes(sites: &[Option<&str>]) -> Vec<Arc<ClusterCoordinator>> {
    let clock: Arc<dyn Clock> = Arc::new(VirtualClock::starting_at(T0));
    let leases: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new(clock));
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
    sites
        .iter()
        .enumerate()
        .map(|(n, site)| {
            ClusterCoordinator::new(
                format!("node-{n}"),
                site.map(str::to_string),
                Arc::clone(&leases),
                Arc::clone(&bus),
            )
        })
        .collect()
}

#[tokio::test]
async fn task_runs_once_across_nodes() {
    let nodes = nodes(&[None; 5]);
    let runs = Arc::new(AtomicUsize::new(0));

    let calls = nodes.iter().map(|node| {
        let runs = Arc::clone(&runs);
        async move {
            node.execute_if_not_executed("k", 30, || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
            })
            .await
        }
    });
    let results = futures::future::join_all(calls).await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(results.iter().filter(|r| r.is_executed()).count(), 1);
    assert_eq!(results.iter().filter(|r| !r.is_executed()).count(), 4);
}

#[tokio::test]
async fn notifications_respect_the_dc_scope() -> anyhow::Result<()> {
    let nodes = nodes(&[Some("a"), Some("a"), Some("b")]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    for node in &nodes {
        let seen = Arc::clone(&seen);
        let name = node.node_id().to_string();
        node.subscribe("realms", move |event: RealmRenamed| {
            seen.lock().push(format!("{name}:{}", event.realm_id));
        });
    }

    let payload = RealmRenamed { realm_id: "r1".into() };
    nodes[0].notify("realms", &payload, true, DcScope::LocalDc).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut local = seen.lock().drain(..).collect::<Vec<_>>();
    local.sort();
    assert_eq!(local, vec!["node-0:r1", "node-1:r1"]);

    nodes[0].notify("realms", &payload, true, DcScope::AllDcs).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.lock().len(), 3);
    Ok(())
}
