//! Reaper sidecar binary.
//!
//! Serves the registration protocol against the local Docker daemon, sweeps
//! once every client has gone, prints the sweep report as JSON and exits.

use anyhow::{Context, Result};
use clap::Parser;
use container_reaper::config::parse_duration;
use container_reaper::{ReaperConfig, ReaperServer};
use container_runtime::DockerRuntime;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "container-reaper")]
#[command(about = "Removes the containers of a test session once it disconnects")]
#[command(long_about = None)]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "REAPER_LISTEN")]
    listen: Option<String>,

    /// Time to wait for the first client, e.g. 60s
    #[arg(long, env = "REAPER_CONNECTION_TIMEOUT", value_parser = parse_duration_arg)]
    connection_timeout: Option<Duration>,

    /// Grace period after the last client disconnected, e.g. 10s
    #[arg(long, env = "REAPER_RECONNECTION_TIMEOUT", value_parser = parse_duration_arg)]
    reconnection_timeout: Option<Duration>,

    /// Configuration file (YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_duration_arg(raw: &str) -> std::result::Result<Duration, String> {
    parse_duration(raw).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => ReaperConfig::from_file(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ReaperConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(timeout) = cli.connection_timeout {
        config.connection_timeout = timeout;
    }
    if let Some(timeout) = cli.reconnection_timeout {
        config.reconnection_timeout = timeout;
    }

    let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;
    let server = ReaperServer::bind(config, Arc::new(runtime))
        .await
        .context("Failed to bind reaper listener")?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt");
            shutdown.cancel();
        }
    });

    let report = server.run().await?;
    if !report.is_clean() {
        warn!(failed = report.failed.len(), "Some containers could not be removed");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
