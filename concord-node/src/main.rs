// SPDX-License-Identifier: MIT

use anyhow::Result;
use clap::Parser;
use concord_node::{Node, NodeConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    info!("╔══════════════════════════════════════════╗");
    info!("║ CONCORD NODE | ID: {:<21} ║", config.node_id);
    info!("║ Port: {:<34} ║", config.node_port);
    info!("╚══════════════════════════════════════════╝");

    let node = Node::start(config).await?;

    tokio::signal::ctrl_c().await?;
    node.shutdown();
    // Give listeners and sweeps a moment to observe the signal.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    info!("[Node] Clean shutdown");
    Ok(())
}
