mod backends;
mod config;
mod dispatch;
mod engine;
mod mac;
mod rate;
mod reconciler;
mod registry;
mod server;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::sync::mpsc;

use crate::backends::{RuleExecutor, create_executor};
use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::dispatch::Dispatcher;

/// ratelimitd - per-client bandwidth shaping for Linux routers
#[derive(Parser, Debug)]
#[command(name = "ratelimitd")]
#[command(version)]
#[command(about = "Per-client MAC based bandwidth shaping with tc HTB and IFB", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Request socket path (overrides the configuration file)
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Log tc commands instead of running them
    #[arg(long)]
    dry_run: bool,

    /// Log filter, e.g. "debug" or "ratelimitd=trace" (overrides RUST_LOG)
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,
}

fn init_logging(args: &Args) {
    let mut builder = pretty_env_logger::formatted_builder();
    builder.filter_level(log::LevelFilter::Info).parse_default_env();
    if let Some(ref filter) = args.log_level {
        builder.parse_filters(filter);
    }
    builder.init();
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let mut terminate = match unix_signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => log::info!("🛑 Received Ctrl+C, shutting down"),
        _ = terminate.recv() => log::info!("🛑 Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = Config::load(&args.config)?;
    let socket = args.socket.clone().unwrap_or(config.socket);

    let executor = create_executor(args.dry_run);
    log::info!("Using {} executor", executor.name());
    let dispatcher = Dispatcher::new(executor, config.defaults);

    let listener = server::bind(&socket)?;

    let (jobs, queue) = mpsc::channel(server::QUEUE_DEPTH);
    let worker = server::spawn_worker(dispatcher, queue)?;

    let served = server::serve(listener, jobs, shutdown_signal()).await;

    // All senders are gone now; the worker drains its queue and tears down
    tokio::task::spawn_blocking(move || worker.join())
        .await
        .context("Failed to wait for worker thread")?
        .map_err(|_| anyhow!("Worker thread panicked"))?;

    if let Err(e) = std::fs::remove_file(&socket) {
        log::debug!("Could not remove {:?}: {}", socket, e);
    }

    served?;
    log::info!("✅ Shutdown complete");
    Ok(())
}
