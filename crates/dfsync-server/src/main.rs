use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dfsync_server::{DfsServer, ServerConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// dfsync file server.
#[derive(Debug, Parser)]
#[command(name = "dfs-server", version, about = "dfsync file server")]
struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(long, env = "DFS_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long, env = "DFS_SERVER_ADDRESS")]
    address: Option<SocketAddr>,

    /// Directory holding the synchronized files.
    #[arg(long, env = "DFS_SERVER_MOUNT")]
    mount_path: Option<PathBuf>,

    /// Concurrent notification workers.
    #[arg(long)]
    workers: Option<usize>,

    /// 0 = warn, 1 = info, 2 = debug, 3 = trace. Ignored when RUST_LOG is set.
    #[arg(long, default_value_t = 1)]
    debug_level: u8,
}

fn level_filter(level: u8) -> &'static str {
    match level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level_filter(cli.debug_level))),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(addr) = cli.address {
        config.bind_addr = addr;
    }
    if let Some(path) = cli.mount_path {
        config.mount_path = path;
    }
    if let Some(workers) = cli.workers {
        config.num_async_workers = workers;
    }
    config.validate()?;

    tracing::info!(
        addr = %config.bind_addr,
        mount = %config.mount_path.display(),
        workers = config.num_async_workers,
        "dfs-server starting"
    );

    let server = Arc::new(DfsServer::start(config).await?);
    let listener = server.bind().await?;

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            signal_server.shutdown();
        }
    });

    server.serve(listener).await?;
    Ok(())
}
