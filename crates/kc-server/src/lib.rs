//! # kc-server
//!
//! Storage node process: builds the root context from the environment,
//! schedules maintenance and waits for a shutdown signal.
//!
//! ```ignore
//! use kc_server::Server;
//!
//! let server = Server::new(kc_core::Config::from_env()?).await?;
//! server.run().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod maintenance;

use std::sync::Arc;

use kc_cluster::{ClusterCoordinator, TimerProvider};
use kc_core::{Clock, Config, SystemClock};
use kc_spi::KeycloakSessionFactory;

/// A running storage node.
#[derive(Debug)]
pub struct Server {
    factory: Arc<KeycloakSessionFactory>,
    timer: TimerProvider,
}

impl Server {
    /// Connects to the cluster and opens every configured backend.
    ///
    /// ## Errors
    ///
    /// Returns an error if the cluster services are unreachable, or storage
    /// fails to open or its consistency check.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cluster = ClusterCoordinator::from_config(&config.cluster, Arc::clone(&clock)).await?;
        tracing::info!(node = %cluster.node_id(), site = ?cluster.site(), "Joined cluster");

        let factory = KeycloakSessionFactory::new(config, clock, cluster).await?;
        Ok(Self::with_factory(factory))
    }

    /// Wraps an existing factory.
    #[must_use]
    pub fn with_factory(factory: Arc<KeycloakSessionFactory>) -> Self {
        Self {
            factory,
            timer: TimerProvider::new(),
        }
    }

    /// Root context.
    #[must_use]
    pub const fn factory(&self) -> &Arc<KeycloakSessionFactory> {
        &self.factory
    }

    /// Starts maintenance tasks and blocks until a shutdown signal arrives.
    ///
    /// ## Errors
    ///
    /// Returns an error if no signal handler can be installed.
    pub async fn run(self) -> anyhow::Result<()> {
        maintenance::schedule_session_sweep(&self.timer, &self.factory);
        tracing::info!(tasks = ?self.timer.scheduled(), "Storage node running");

        shutdown_signal().await?;

        self.timer.cancel_all();
        self.factory.cluster().shutdown();
        tracing::info!("Shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutdown signal received");
    Ok(())
}
