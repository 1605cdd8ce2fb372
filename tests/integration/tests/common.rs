//! Shared fixtures.

use std::sync::Arc;

use kc_cluster::ClusterCoordinator;
use kc_core::{Clock, Config, VirtualClock};
use kc_model::{Entity, SessionSettings};
use kc_spi::{KeycloakSession, KeycloakSessionFactory};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("kc_=debug")
        .with_test_writer()
        .try_init();
}

/// Start of virtual time in every test.
pub const T0: i64 = 1_000_000;

/// A root context on in-memory backends driven by a virtual clock.
pub struct TestEnv {
    pub clock: Arc<VirtualClock>,
    pub factory: Arc<KeycloakSessionFactory>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        init_tracing();
        let clock = Arc::new(VirtualClock::starting_at(T0));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let factory = KeycloakSessionFactory::in_memory(config, dyn_clock);
        Self { clock, factory }
    }

    /// A root context whose backends follow `config`.
    pub async fn configured(config: Config) -> anyhow::Result<Self> {
        init_tracing();
        let clock = Arc::new(VirtualClock::starting_at(T0));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let cluster = ClusterCoordinator::standalone(config.cluster.node_id.clone(), Arc::clone(&dyn_clock));
        let factory = KeycloakSessionFactory::new(config, dyn_clock, cluster).await?;
        Ok(Self { clock, factory })
    }

    pub async fn session(&self) -> anyhow::Result<Arc<KeycloakSession>> {
        Ok(self.factory.create().await?)
    }

    /// Creates and commits a realm whose sessions idle out after 60 seconds.
    pub async fn create_realm(&self, name: &str) -> anyhow::Result<String> {
        let session = self.session().await?;
        let realms = session.realms().await?;
        let mut realm = realms.create_realm(Some(name), name).await?;
        realm.set_session_settings(
            SessionSettings::default()
                .with_idle_timeout(60)
                .with_max_lifespan(3600)
                .with_offline(600, None),
        );
        let id = realm.id().unwrap_or(name).to_string();
        realms.update_realm(realm).await?;
        session.commit().await?;
        Ok(id)
    }
}
