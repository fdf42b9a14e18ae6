//! RedRing - Redis-compatible in-memory key-value store
//!
//! Durability through an append-only file with background compaction;
//! optional clustering over a consistent hash ring with try-commit-cancel
//! distributed transactions.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use aof::AofHandler;
use cluster::Cluster;
use redring::config::Config;
use redring::server::RespServer;
use storage::Store;

/// RedRing node configuration
#[derive(Parser, Debug)]
#[command(name = "redring-node")]
#[command(about = "RedRing - Redis-compatible in-memory key-value store")]
struct Args {
    /// RESP listen address
    #[arg(short, long)]
    bind: Option<String>,

    /// Data directory (holds the append-only file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Number of logical databases
    #[arg(long)]
    databases: Option<usize>,

    /// Disable the append-only file
    #[arg(long)]
    no_append_only: bool,

    /// Enable cluster mode
    #[arg(long)]
    cluster: bool,

    /// This node's advertised address (defaults to the bind address)
    #[arg(long)]
    self_addr: Option<String>,

    /// Peer node addresses (repeatable)
    #[arg(long)]
    peers: Vec<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Configuration file path (YAML format)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {:?}", path))?,
        None => Config::default(),
    };

    // Command line arguments override file values
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(data_dir) = args.data_dir {
        config.database.data_dir = data_dir;
    }
    if let Some(databases) = args.databases {
        config.database.databases = databases;
    }
    if args.no_append_only {
        config.database.append_only = false;
    }
    if args.cluster {
        config.cluster.enabled = true;
    }
    if let Some(self_addr) = args.self_addr {
        config.cluster.self_addr = self_addr;
    }
    if !args.peers.is_empty() {
        config.cluster.peers = args.peers;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    if config.cluster.self_addr.is_empty() {
        config.cluster.self_addr = config.server.bind.clone();
    }

    let level = match config.log.level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting redring node on {}", config.server.bind);

    let store = Arc::new(Store::new(config.database.databases));

    let aof = if config.database.append_only {
        std::fs::create_dir_all(&config.database.data_dir)
            .with_context(|| format!("creating data dir {:?}", config.database.data_dir))?;
        let path = config.database.aof_path();
        info!("append-only file: {:?}", path);
        Some(AofHandler::new(&path, store.clone()).context("opening append-only file")?)
    } else {
        None
    };

    let peers = if config.cluster.enabled {
        info!(
            "cluster mode: self={} peers={:?}",
            config.cluster.self_addr, config.cluster.peers
        );
        config.cluster.peers.clone()
    } else {
        Vec::new()
    };
    let cluster = Cluster::new(
        cluster::ClusterConfig {
            self_addr: config.cluster.self_addr.clone(),
            peers,
            replicas: config.cluster.replicas,
        },
        store,
        aof.clone(),
    );

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {:?}", config.server.bind))?;
    let server = RespServer::new(cluster.clone(), addr);

    tokio::select! {
        result = server.start() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            cluster.close().await;
            if let Some(aof) = aof {
                aof.close().await;
            }
        }
    }
    Ok(())
}
