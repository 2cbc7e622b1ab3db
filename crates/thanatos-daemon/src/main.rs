//! thanatosd - Thanatos resource-management daemon
//!
//! Runs in the foreground; the Android init service supervises it.
//!
//! The main thread drives the timer event loop. The RPC server runs on its
//! own thread with a multi-threaded runtime.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use thanatos_daemon::{Daemon, DaemonConfig, DecisionEngine, EngineServices, MemoryEngine};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// thanatosd - Thanatos resource-management daemon
#[derive(Parser, Debug)]
#[command(name = "thanatosd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file; defaults apply when absent
    #[arg(short, long, env = "THANATOSD_CONFIG")]
    config: Option<PathBuf>,

    /// Path of the Unix socket, overriding the configuration file
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(socket) = args.socket {
        config.server.socket_path = socket;
    }
    config.validate().context("invalid configuration")?;

    let engine_config = config.engine_config();
    let daemon = Daemon::start(&config, |services: Arc<dyn EngineServices>| {
        Arc::new(MemoryEngine::new(engine_config, services)) as Arc<dyn DecisionEngine>
    })
    .context("failed to start daemon")?;

    info!(socket = %daemon.socket_path().display(), "waiting for SIGINT or SIGTERM");
    daemon
        .run_until_shutdown()
        .context("daemon did not shut down cleanly")
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}
