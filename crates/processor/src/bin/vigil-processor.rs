//! vigil-processor — streaming metrics pipeline worker.
//!
//! Consumes telemetry events from the broker, aggregates them over a
//! sliding window, persists aggregates to the time-series store, mirrors
//! the newest snapshot to the cache, and evaluates alert rules.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use vigil_core::{config, Config, SystemClock};
use vigil_processor::Processor;

// ── CLI ─────────────────────────────────────────────────────────────

/// Streaming metrics pipeline: broker → window → store/cache → alerts.
#[derive(Parser, Debug)]
#[command(name = "vigil-processor", version, about)]
struct Cli {
    /// Run retention cleanup on the time-series store before starting.
    #[arg(long, env = "CLEANUP_ON_START", default_value_t = false)]
    cleanup_on_start: bool,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    config::load_dotenv();
    let config = Config::from_env();
    config.log_summary();

    let mut processor = Processor::initialize(config, Arc::new(SystemClock)).await?;

    if cli.cleanup_on_start {
        let deleted = processor.cleanup_old_data().await?;
        info!(deleted, "startup retention cleanup complete");
    }

    processor.start();

    wait_for_shutdown().await;
    info!("shutdown signal received");

    processor.stop().await;
    Ok(())
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C (cross-platform fallback).
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl_c");
    }
}
