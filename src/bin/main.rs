use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shardline::{Node, NodeConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shardline")]
#[command(version, about = "Sharded gossip consensus node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the node
    Run {
        /// Path to configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the effective configuration after files and environment are applied
    PrintConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            let config = NodeConfig::load(config.as_deref()).context("failed to load configuration")?;
            init_tracing(&config.log_filter);
            info!(
                node = %config.node_id,
                listen = %config.listen_addr,
                peers = config.peers.len(),
                "starting shardline node"
            );

            let node = Node::new(config)?;
            node.bootstrap();
            node.run().await
        }
        Command::PrintConfig { config } => {
            let config = NodeConfig::load(config.as_deref()).context("failed to load configuration")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
