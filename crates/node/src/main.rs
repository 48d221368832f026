//! SQLChain Node
//!
//! Runs one chain member: restores (or initializes) the chain from disk,
//! produces blocks on its turns and admits the blocks handed to it.

use anyhow::Result;
use clap::Parser;
use sqlchain::{
    Capabilities, ChainConfig, ChainCoordinator, ChainRpcServer, ChannelBroadcaster, LocalKeyStore,
    RoundRobin,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::NodeConfig;

/// SQLChain chain coordinator node
#[derive(Parser, Debug)]
#[command(name = "sqlchain-node")]
#[command(about = "Slot-timed chain coordinator for a SQL ledger", long_about = None)]
struct Args {
    /// Data directory for persistent state
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Node config file (created on first run, default: <data-dir>/node.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { "debug" } else { args.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    run(args).await
}

async fn run(args: Args) -> Result<()> {
    std::fs::create_dir_all(&args.data_dir)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| args.data_dir.join("node.json"));
    let node_config = NodeConfig::load_or_create(&config_path, None)?;

    let genesis = node_config.genesis()?;
    let members = node_config.member_keys()?;
    let key = node_config.signing_key()?;

    tracing::info!("Starting SQLChain node");
    tracing::info!("  Data directory: {:?}", args.data_dir);
    tracing::info!("  Period: {}ms", node_config.period_ms);
    tracing::info!("  Genesis: {}", genesis.hash());
    tracing::info!("  Members: {}", members.len());

    // Wire capabilities
    let key_store = Arc::new(LocalKeyStore::new());
    if let Some(key) = key {
        key_store.set_key(key);
    }
    let local = key_store.public_key().unwrap_or_default();
    match key_store.public_key() {
        Some(public) => tracing::info!("  Producer: {}", bs58::encode(public).into_string()),
        None => tracing::info!("  Producer: none (follower)"),
    }

    let broadcaster = Arc::new(ChannelBroadcaster::new(64));
    let mut blocks = broadcaster.subscribe();
    let capabilities = Capabilities::new(
        Arc::new(RoundRobin::new(members, local)),
        key_store,
        broadcaster,
    );

    let chain_config = ChainConfig::new(args.data_dir.join("chain"), node_config.period(), genesis);
    let chain = Arc::new(ChainCoordinator::open(chain_config, capabilities)?);
    tracing::info!("Chain at height {} (head {})", chain.height(), chain.head());
    if chain.next_slot_missed()? {
        tracing::warn!(
            "Slot for height {} ended at {}; its blocks will be rejected and the chain cannot advance",
            chain.height() + 1,
            chain.clock().slot_start(chain.height() + 2)?
        );
    }

    let producer = chain.spawn_block_producing_cycle()?;

    // Locally produced blocks go through admission like peer blocks
    let admit_chain = chain.clone();
    let admission = tokio::spawn(async move {
        loop {
            match blocks.recv().await {
                Ok(block) => {
                    let chain = admit_chain.clone();
                    let hash = *block.hash();
                    match tokio::task::spawn_blocking(move || chain.advise_new_block(&block)).await {
                        Ok(Ok(())) => tracing::info!("Admitted block {}", hash),
                        Ok(Err(e)) => tracing::warn!("Rejected block {}: {}", hash, e),
                        Err(e) => tracing::error!("Admission task failed: {}", e),
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::warn!("Admission lagged, skipped {} blocks", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tracing::info!("SQLChain node running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");

    chain.stop();
    admission.abort();
    if tokio::task::spawn_blocking(move || producer.join()).await?.is_err() {
        tracing::error!("Block producing thread panicked");
    }

    tracing::info!("Node stopped at height {}", chain.height());

    Ok(())
}
