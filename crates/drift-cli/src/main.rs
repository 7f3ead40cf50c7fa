//! DRIFT command-line interface.
//!
//! Hosting program for the transfer engine: `send` runs an engine and one
//! transfer to completion, `receive` runs a receive server until
//! interrupted, `digest` prints a file's rolling digest for end-to-end
//! comparison.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use config::Config;
use drift_core::Priority;
use drift_engine::{EngineConfig, ReceiveConfig, ReceiveServer, TransferEngine};
use drift_files::integrity::file_hash;

/// DRIFT - reliable, priority-aware file transfer over UDP
#[derive(Parser)]
#[command(name = "drift")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "drift.toml")]
    config: PathBuf,

    /// Local bind address (overrides the config file)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file to a remote receiver
    Send {
        /// File to send
        file: PathBuf,

        /// Receiver address, e.g. 192.0.2.10:9090
        remote: SocketAddr,

        /// Transfer priority
        #[arg(long, value_enum, default_value = "normal")]
        priority: PriorityArg,
    },

    /// Receive files until interrupted
    Receive {
        /// Output directory (overrides the config file)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the 64-bit rolling digest of a file
    Digest {
        /// File to hash
        file: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorityArg {
    Normal,
    High,
    Critical,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
            PriorityArg::Critical => Priority::Critical,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let bind_addr: SocketAddr = match cli.bind {
        Some(addr) => addr,
        None => config.network.bind_addr.parse()?,
    };

    match cli.command {
        Commands::Send {
            file,
            remote,
            priority,
        } => send(config, bind_addr, file, remote, priority.into()).await,
        Commands::Receive { output } => receive(config, bind_addr, output).await,
        Commands::Digest { file } => {
            let digest = file_hash(&file);
            if digest.is_empty() {
                return Err(format!("cannot read {}", file.display()).into());
            }
            println!("{digest}  {}", file.display());
            Ok(())
        }
    }
}

async fn send(
    config: Config,
    bind_addr: SocketAddr,
    file: PathBuf,
    remote: SocketAddr,
    priority: Priority,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = TransferEngine::new(EngineConfig {
        bind_addr,
        chunk_size: config.transfer.chunk_size,
        checkpoint_dir: config.transfer.checkpoint_dir.clone(),
    })
    .await?;

    let digest = file_hash(&file);
    let file_id = engine.start_transfer(&file, remote, priority)?;
    info!("sending {} as transfer {file_id}, digest {digest}", file.display());

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let stats = engine.get_stats(&file_id);
        if stats.completed {
            info!(
                "done: {} bytes acknowledged, {} retransmissions, {:.2} Mbps",
                stats.bytes_acked, stats.retransmissions, stats.throughput_mbps
            );
            break;
        }
        info!(
            "progress: {}/{} bytes acked, {:.2} Mbps",
            stats.bytes_acked, stats.bytes_sent, stats.throughput_mbps
        );
    }

    engine.stop().await;
    Ok(())
}

async fn receive(
    config: Config,
    bind_addr: SocketAddr,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let output_dir = output.unwrap_or(config.transfer.output_dir);
    let server = ReceiveServer::bind(ReceiveConfig {
        bind_addr,
        output_dir: output_dir.clone(),
    })
    .await?;

    info!("receiving into {}; press Ctrl-C to stop", output_dir.display());
    tokio::signal::ctrl_c().await?;

    server.stop().await;
    Ok(())
}
