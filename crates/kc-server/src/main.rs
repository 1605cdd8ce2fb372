//! Storage node entry point.

#![forbid(unsafe_code)]

use kc_core::Config;
use kc_server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,kc_=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Storage node starting");

    let config = Config::from_env()?;
    Server::new(config).await?.run().await
}
