//! NetworkNeuron CLI
//!
//! Starts a relay node and exposes a few operator commands against the
//! local node state.

use std::sync::Arc;

use clap::{Parser, Subcommand};

use networkneuron::api::AdminApi;
use networkneuron::protocol::{short_id, TokenAmount};
use networkneuron::{NodeConfig, NodeCoordinator, Result};

#[derive(Parser, Debug)]
#[command(name = "networkneuron")]
#[command(about = "Decentralized relay overlay with bandwidth incentives")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Log filter, e.g. "info" or "networkneuron=debug"
    #[arg(short, long, default_value = "info")]
    verbosity: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the relay node
    Start,

    /// Show node status
    Status,

    /// Show the operator account balance and stake
    Balance,

    /// Lock tokens as stake
    Stake {
        /// Amount in whole tokens
        amount: f64,
    },

    /// Release staked tokens
    Unstake {
        /// Amount in whole tokens
        amount: f64,
    },

    /// Run a reward distribution now
    Distribute {
        #[arg(default_value = "manual")]
        period: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::{fmt, EnvFilter};
    fmt()
        .with_env_filter(EnvFilter::new(&cli.verbosity))
        .init();

    tracing::info!("starting networkneuron");

    let config = NodeConfig::load(cli.config.as_deref())?;
    let node = Arc::new(NodeCoordinator::new(config).await?);
    let api = AdminApi::new(node.clone());

    match cli.command {
        Commands::Start => {
            node.start().await?;
            println!(
                "node {} listening on {}",
                short_id(&node.identity.node_id),
                node.config.listen_addr
            );
            tokio::signal::ctrl_c()
                .await
                .map_err(networkneuron::Error::Io)?;
            println!("shutting down");
            node.shutdown().await?;
        }
        Commands::Status => {
            let status = api.status().await;
            println!("node:      {}", hex::encode(status.node_id));
            println!("listen:    {}", status.listen_addr);
            println!("region:    {}", status.region);
            println!("peers:     {}", status.peers_active);
            println!("routes:    {}", status.routes_active);
            println!("sessions:  {}", status.sessions_active);
            println!("balance:   {}", status.balance);
            println!("stake:     {}", status.stake);
            println!("pool:      {}", status.reward_pool);
        }
        Commands::Balance => {
            let node_id = node.identity.node_id;
            println!("balance: {}", node.ledger.balance(&node_id).await);
            println!("stake:   {}", node.ledger.stake_of(&node_id).await);
        }
        Commands::Stake { amount } => {
            let node_id = node.identity.node_id;
            let tx = api.stake(&node_id, TokenAmount::from_tokens(amount)?).await?;
            println!("staked {} (tx {})", tx.amount, hex::encode(tx.tx_id));
            node.ledger.flush().await?;
        }
        Commands::Unstake { amount } => {
            let node_id = node.identity.node_id;
            let tx = api
                .unstake(&node_id, TokenAmount::from_tokens(amount)?)
                .await?;
            println!("unstaked {} (tx {})", tx.amount, hex::encode(tx.tx_id));
            node.ledger.flush().await?;
        }
        Commands::Distribute { period } => {
            let report = api.distribute_rewards(&period).await?;
            println!(
                "distribution {}: {} paid, {} skipped{}",
                report.period,
                report.paid.len(),
                report.skipped,
                if report.pool_exhausted {
                    " (pool exhausted)"
                } else {
                    ""
                }
            );
        }
    }

    Ok(())
}
