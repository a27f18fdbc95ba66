//! Watershed Node binary
//!
//! Peer-funded micro-lending ledger daemon.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use watershed_node::{NodeConfig, WatershedNode};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watershed_node=info,watershed_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Watershed Node");

    let config = NodeConfig::from_env()?;

    // Create and run node
    let node = WatershedNode::new(config).await?;
    node.run().await?;

    Ok(())
}
