use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use evchain_node::{NodeConfig, ReplicaNode};

#[derive(Debug, Parser)]
#[command(name = "evchain-node", about = "evchain off-chain replica")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long = "config", value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = NodeConfig::load(&args.config)?;

    let node = ReplicaNode::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");

    if let Err(err) = node.shutdown().await {
        error!(?err, "shutdown finished with errors");
        return Err(err);
    }
    Ok(())
}
