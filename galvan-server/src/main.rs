//! # Galvan Server
//!
//! Industrial telemetry host process: protocol collectors acquire tag
//! samples from field devices, a bounded pipeline batches them into
//! Postgres, a dispatcher fans them out to live subscribers and the alarm
//! and collection-rule engines, and background jobs roll raw samples into
//! minute/hour aggregates under a watermark-guarded retention policy.
//!
//! Exit code 0 on clean shutdown; non-zero only on startup failure (store
//! unreachable, invalid configuration). Runtime faults are retried or
//! degraded inside the components and never terminate the process.

mod runtime;

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use galvan_config::ConfigLoader;

use crate::runtime::AppRuntime;

/// Command line arguments for the Galvan telemetry server
#[derive(Parser, Debug)]
#[command(name = "galvan-server")]
#[command(about = "Industrial telemetry ingestion and evaluation server")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "GALVAN_CONFIG")]
    config: Option<PathBuf>,

    /// Force simulation mode for every device (overrides config)
    #[arg(long, env = "GALVAN_SIMULATION_FLAG")]
    simulation: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "galvan_server=info,galvan_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_file(path);
    }
    let mut config = loader.load()?;
    if args.simulation {
        config.collectors.simulation = true;
    }
    config.validate()?;
    info!(
        pipeline_capacity = config.pipeline.capacity,
        batch_size = config.pipeline.batch_size,
        simulation = config.collectors.simulation,
        "configuration loaded"
    );

    let runtime = AppRuntime::start(config).await?;

    wait_for_shutdown_signal().await;
    runtime.shutdown().await;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}
