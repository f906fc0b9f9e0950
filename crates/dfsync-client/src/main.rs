use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dfsync_client::{ClientConfig, ClientNode, Daemon, FetchOutcome, StoreOutcome};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// dfsync client.
#[derive(Debug, Parser)]
#[command(name = "dfs-client", version, about = "dfsync client and sync daemon")]
struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(long, env = "DFS_CLIENT_CONFIG")]
    config: Option<PathBuf>,

    /// Server address.
    #[arg(long, env = "DFS_CLIENT_ADDRESS")]
    address: Option<String>,

    /// Local directory kept in sync.
    #[arg(long, env = "DFS_CLIENT_MOUNT")]
    mount_path: Option<PathBuf>,

    /// Per-call deadline in milliseconds.
    #[arg(long)]
    deadline_timeout: Option<u64>,

    /// Client identifier sent with every call.
    #[arg(long, env = "DFS_CLIENT_ID")]
    client_id: Option<String>,

    /// 0 = warn, 1 = info, 2 = debug, 3 = trace. Ignored when RUST_LOG is set.
    #[arg(long, default_value_t = 1)]
    debug_level: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Keep the mount directory in sync until interrupted.
    Mount,
    /// Download one file into the mount directory.
    Fetch { filename: String },
    /// Upload one file from the mount directory.
    Store { filename: String },
    /// Delete one file on the server.
    Delete { filename: String },
    /// List files on the server.
    List,
    /// Show one file's server-side status.
    Stat { filename: String },
}

fn level_filter(level: u8) -> &'static str {
    match level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
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
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(addr) = cli.address {
        config.server_addr = addr;
    }
    if let Some(path) = cli.mount_path {
        config.mount_path = path;
    }
    if let Some(ms) = cli.deadline_timeout {
        config.deadline_timeout_ms = ms;
    }
    if let Some(id) = cli.client_id {
        config.client_id = id;
    }

    tokio::fs::create_dir_all(&config.mount_path)
        .await
        .with_context(|| format!("failed to create {}", config.mount_path.display()))?;
    let node = Arc::new(
        ClientNode::connect(&config)
            .await
            .with_context(|| format!("failed to connect to {}", config.server_addr))?,
    );

    match cli.command {
        Command::Mount => {
            let daemon = Daemon::mount(node, &config).await?;
            tracing::info!(mount = %config.mount_path.display(), "sync daemon running");
            shutdown_signal().await?;
            tracing::info!("signal received, unmounting");
            daemon.shutdown().await;
        }
        Command::Fetch { filename } => match node.fetch(&filename).await? {
            FetchOutcome::Fetched { bytes, modified } => {
                println!("{}: fetched {} bytes, modified {}", filename, bytes, modified)
            }
            FetchOutcome::AlreadySynchronized => println!("{}: already synchronized", filename),
        },
        Command::Store { filename } => match node.store(&filename).await? {
            StoreOutcome::Stored(ack) => println!("{}: stored, modified {}", ack.name, ack.modified),
            StoreOutcome::AlreadySynchronized => println!("{}: already synchronized", filename),
        },
        Command::Delete { filename } => {
            let ack = node.delete(&filename).await?;
            println!("{}: deleted, last modified {}", ack.name, ack.modified);
        }
        Command::List => {
            let listing = node.list().await?;
            for file in listing.files {
                println!("{:>12}  {:>12}  {}", file.size, file.modified, file.name);
            }
        }
        Command::Stat { filename } => {
            let status = node.stat(&filename).await?;
            println!(
                "{}: size {} created {} modified {}",
                status.name, status.size, status.created, status.modified
            );
        }
    }
    Ok(())
}
