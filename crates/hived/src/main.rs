//! hived: the hive daemon.
//!
//! Loads the hive from its store, runs the scheduler loop and serves the
//! admin API until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! hived run --config /etc/hive/hive.toml --data-dir /var/lib/hive --port 8765
//! hived default-config > hive.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use hive_core::HiveConfig;
use hive_scheduler::{Hive, HiveRuntime, LogOutbox, epoch_ms};
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "hived", about = "Hive tablet scheduler daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and the admin API.
    Run {
        /// Hive configuration file (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/hive")]
        data_dir: PathBuf,

        /// Admin API port.
        #[arg(long, default_value = "8765")]
        port: u16,

        /// Overrides `hive_id` from the config file.
        #[arg(long)]
        hive_id: Option<u64>,
    },
    /// Print the default configuration as TOML.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,hived=debug,hive_scheduler=debug")
            }),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            port,
            hive_id,
        } => run(config.as_deref(), data_dir, port, hive_id).await,
        Command::DefaultConfig => {
            print!("{}", HiveConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(
    config_path: Option<&Path>,
    data_dir: PathBuf,
    port: u16,
    hive_id: Option<u64>,
) -> anyhow::Result<()> {
    let mut config = match config_path {
        Some(path) => HiveConfig::from_file(path)?,
        None => HiveConfig::default(),
    };
    if let Some(hive_id) = hive_id {
        config = config.with_hive_id(hive_id);
    }
    info!(hive_id = config.hive_id, "hive daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("hive.redb");
    let store = hive_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let root_domain = config.root_domain;
    let hive = Hive::load(config, store, epoch_ms())?;
    info!(tablets = hive.tablets().len(), "hive loaded");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Scheduler loop ─────────────────────────────────────────

    let (runtime, handle) = HiveRuntime::new(hive, LogOutbox);
    let runtime_handle = tokio::spawn(runtime.run(shutdown_rx));

    // ── Admin API ──────────────────────────────────────────────

    let router = hive_api::build_router(handle, root_domain);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "admin API starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let hive = runtime_handle.await?;
    info!(tablets = hive.tablets().len(), "hive daemon stopped");
    Ok(())
}
