use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use parkmesh_logging::{LogConfig, SubscriberBuilder};
use parkmesh_node::{MeshConfig, NodeCoordinator};
use parkmesh_storage::{RedbEventStore, RedbStorageConfig};

/// Event sync daemon for a parking central node
#[derive(Parser, Debug)]
#[command(name = "parkmeshd", version)]
struct Args {
    /// Mesh configuration file (JSON)
    #[arg(long, short)]
    config: PathBuf,

    /// Directory for the session database
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Human-readable console output instead of JSON lines
    #[arg(long)]
    pretty: bool,

    /// Also write rotated JSONL logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Extra filter directive such as `parkmesh_transport=trace`; repeatable
    #[arg(long = "log-directive")]
    log_directives: Vec<String>,

    /// Seconds between status log lines; 0 disables
    #[arg(long, default_value_t = 60)]
    status_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = MeshConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let mut log_config = match &args.log_dir {
        Some(dir) => LogConfig::production(dir.clone()).for_node(config.node_id()),
        None => LogConfig::default(),
    };
    log_config.console.enabled = true;
    let mut logging = SubscriberBuilder::new()
        .with_config(log_config)
        .with_level(args.log_level.clone())
        .with_pretty(args.pretty);
    for directive in &args.log_directives {
        logging = logging.with_directive(directive.clone());
    }
    let _log_guard = logging.init();
    let store = RedbEventStore::open(RedbStorageConfig::in_dir(args.data_dir.clone()))
        .with_context(|| format!("opening store in {}", args.data_dir.display()))?;

    let node = NodeCoordinator::new(config, Arc::new(store))?;
    node.start().await?;

    let mut status_ticker = (args.status_interval_secs > 0)
        .then(|| tokio::time::interval(Duration::from_secs(args.status_interval_secs)));

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for ctrl-c")?;
                info!("Shutdown requested");
                break;
            }
            _ = async {
                match status_ticker.as_mut() {
                    Some(ticker) => { ticker.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                let status = node.status();
                info!(
                    running = status.running,
                    standalone = status.standalone,
                    connected = status.peers.iter().filter(|p| p.connected).count(),
                    peers = status.peers.len(),
                    sent = status.messages_sent,
                    received = status.messages_received,
                    "Node status"
                );
            }
        }
    }

    node.stop().await?;
    Ok(())
}
