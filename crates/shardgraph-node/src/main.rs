use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use shardgraph_coordinator::{init_tracing, LocalCluster};
use shardgraph_core::{MetaStore, ShardgraphConfig};
use shardgraph_store::{FileMetaStore, MemoryMetaStore};

#[derive(Parser, Debug)]
#[command(name = "shardgraph-node")]
#[command(about = "Single-process shardgraph cluster", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file; defaults to SHARDGRAPH_CONFIG and ./config/shardgraph
    #[arg(long, short, env = "SHARDGRAPH_CONFIG_FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the cluster until interrupted (default)
    Run,

    /// Print the effective configuration as JSON
    ShowConfig,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ShardgraphConfig> {
    let config = match path {
        Some(path) => ShardgraphConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ShardgraphConfig::load().context("failed to load config")?,
    };
    Ok(config)
}

async fn open_meta_store(config: &ShardgraphConfig) -> anyhow::Result<Arc<dyn MetaStore>> {
    if config.meta.in_memory {
        tracing::warn!("Using in-memory metadata; cluster state is lost on exit");
        return Ok(Arc::new(MemoryMetaStore::new()));
    }
    let store = FileMetaStore::new(&config.meta.path)
        .await
        .with_context(|| format!("failed to open meta store at {}", config.meta.path.display()))?;
    Ok(Arc::new(store))
}

async fn run(config: ShardgraphConfig) -> anyhow::Result<()> {
    init_tracing(&config.logging);

    let meta = open_meta_store(&config).await?;
    let cluster = LocalCluster::start(&config, meta)
        .await
        .context("failed to start cluster")?;

    let info = cluster.snapshots().query_snapshot_info().await;
    tracing::info!(
        query_snapshot_id = %info.query_snapshot_id,
        ddl_snapshot_id = %info.ddl_snapshot_id,
        "Node ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    let completed = cluster.shutdown().await;
    tracing::info!(completed_snapshots = ?completed, "Node stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
