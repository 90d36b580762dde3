use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tracing::{info, warn};

use maelstrom_node::{cli::Cli, node::Node, transport::Outbox};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    // stdout carries protocol messages, so diagnostics must stay on stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.command.node_config();
    info!(workload = ?config.workload, "starting node");

    let node = Arc::new(Node::new(config, Outbox::stdout()));
    node.start(BufReader::new(tokio::io::stdin()))
        .context("failed to start node")?;
    spawn_ctrl_c_handler(Arc::clone(&node));

    node.await_termination()
        .await
        .context("node terminated with error")?;

    info!("node stopped");
    Ok(())
}

fn spawn_ctrl_c_handler(node: Arc<Node>) {
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(?error, "failed to install ctrl-c handler");
            return;
        }
        info!("ctrl-c received");
        node.shutdown();
    });
}
