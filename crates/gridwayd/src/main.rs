//! gridwayd — the Gridway scheduler daemon.
//!
//! Single binary that assembles the scheduler subsystems:
//! - Job record store (redb)
//! - Command listener (negotiation, claim lifecycle, reschedule)
//! - Scheduler core: queue scan, negotiation, dispatch, reaper
//!
//! # Usage
//!
//! ```text
//! gridwayd run --listen 0.0.0.0:9700 --data-dir /var/lib/gridway \
//!     --config /etc/gridway/scheduler.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use gridway_scheduler::{Scheduler, SchedulerConfig};
use gridway_state::JobStore;

#[derive(Parser)]
#[command(name = "gridwayd", about = "Gridway scheduler daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler.
    Run {
        /// Address to accept authority/host commands on.
        #[arg(long, default_value = "0.0.0.0:9700")]
        listen: String,

        /// Data directory for the persistent job store.
        #[arg(long, default_value = "/var/lib/gridway")]
        data_dir: PathBuf,

        /// Optional TOML config; defaults apply where absent.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gridway=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            listen,
            data_dir,
            config,
        } => run(listen, data_dir, config).await,
    }
}

async fn run(listen: String, data_dir: PathBuf, config: Option<PathBuf>) -> anyhow::Result<()> {
    let config: SchedulerConfig = match config {
        Some(path) => toml::from_str(&std::fs::read_to_string(&path)?)?,
        None => SchedulerConfig::default(),
    };

    // Failing to open the store or bind the listener is fatal; everything
    // past this point degrades gracefully instead.
    std::fs::create_dir_all(&data_dir)?;
    let store = JobStore::open(&data_dir.join("jobs.redb"))?;
    let listener = TcpListener::bind(&listen).await?;
    let local_addr = listener.local_addr()?.to_string();
    info!(%local_addr, data_dir = %data_dir.display(), "gridwayd starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let scheduler = Scheduler::new(config, store, local_addr);
    scheduler.run(listener, shutdown_rx).await?;
    info!("gridwayd stopped");
    Ok(())
}
