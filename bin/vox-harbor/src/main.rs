use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use vox_common::Config;
use vox_engine::transport::memory::{MemoryConnector, MemoryNetwork};
use vox_engine::transport::SessionConnector;
use vox_engine::Engine;
use vox_server::controller::ControllerState;
use vox_server::discover::AutoDiscover;
use vox_server::shard_client::ShardFleet;
use vox_store::logging::StoreLogLayer;
use vox_store::{ClickHouseStore, Store};

#[derive(Parser)]
#[command(name = "vox-harbor")]
#[command(about = "Sharded crawler and retrieval system for a public chat network")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one shard: session fleet, crawl engine and the shard RPC surface.
    Shard {
        /// Overrides SHARD_NUM.
        #[arg(long)]
        num: Option<u32>,
    },
    /// Run the controller: cross-shard query fan-out and the web-UI API.
    Controller,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    match cli.command {
        Commands::Shard { num } => {
            if let Some(num) = num {
                config.shard = num;
            }
            run_shard(Arc::new(config)).await
        }
        Commands::Controller => run_controller(Arc::new(config)).await,
    }
}

/// Stream formatting plus the ClickHouse mirror of every log record.
fn init_logging(store: Arc<dyn Store>, shard: u32) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(StoreLogLayer::new(store, shard))
        .init();
}

/// The production MTProto transport is deployed as a separate adapter; the
/// in-memory network backs tests and local development.
fn connector_from_env() -> Result<Box<dyn SessionConnector>> {
    match std::env::var("TRANSPORT").as_deref() {
        Ok("memory") | Err(_) => Ok(Box::new(MemoryConnector::new(MemoryNetwork::new()))),
        Ok(other) => anyhow::bail!("unknown TRANSPORT {other:?}"),
    }
}

async fn run_shard(config: Arc<Config>) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(ClickHouseStore::connect(&config).await?);
    init_logging(Arc::clone(&store), config.shard);

    let connector = connector_from_env()?;
    let engine = Engine::bootstrap(Arc::clone(&config), store, connector.as_ref()).await?;
    engine.start().await?;

    let shard_bind_addr = config.shard_bind_addr();
    let serving = vox_server::shard::serve(Arc::clone(&engine), &shard_bind_addr);
    tokio::select! {
        outcome = serving => outcome?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    engine.shutdown().await;
    Ok(())
}

async fn run_controller(config: Arc<Config>) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(ClickHouseStore::connect(&config).await?);
    init_logging(Arc::clone(&store), config.shard);

    let shards = Arc::new(ShardFleet::from_endpoints(&config.shard_endpoints));

    if config.auto_discover && !config.read_only {
        let auto = Arc::new(AutoDiscover::new(Arc::clone(&store), Arc::clone(&shards)));
        tokio::spawn(auto.run());
    }

    let state = ControllerState {
        config: Arc::clone(&config),
        store,
        shards,
    };
    vox_server::controller::serve(state, &config.controller_bind_addr()).await
}
