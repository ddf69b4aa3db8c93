//! specwrightd - Specwright orchestration daemon binary.

use clap::Parser;
use specwright_core::Config;
use specwrightd::{Daemon, DaemonConfig};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "specwrightd", about = "Specwright orchestration daemon")]
struct Args {
    /// Path to the SQLite database (default: ~/.local/share/specwright/).
    #[arg(long)]
    db: Option<PathBuf>,

    /// HTTP port to listen on.
    #[arg(long, default_value_t = 7700)]
    port: u16,

    /// Engine config file (key=value format).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the maximum number of background workers.
    #[arg(long)]
    max_workers: Option<usize>,
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut daemon_config = DaemonConfig::default();
    if let Some(db) = args.db {
        daemon_config.db_path = db;
    }
    daemon_config.port = args.port;
    if let Some(path) = args.config {
        match Config::from_file(&path) {
            Ok(config) => daemon_config.config = config,
            Err(e) => {
                error!("failed to load config {}: {e}", path.display());
                std::process::exit(1);
            }
        }
    }
    if let Some(max_workers) = args.max_workers {
        daemon_config.config.max_workers = max_workers;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        match Daemon::new(daemon_config).await {
            Ok(daemon) => {
                let daemon_ref = &daemon;
                tokio::select! {
                    result = daemon.run() => {
                        if let Err(e) = result {
                            error!("daemon error: {e}");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT");
                        daemon_ref.shutdown();
                    }
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {e}");
                std::process::exit(1);
            }
        }
    });
}
