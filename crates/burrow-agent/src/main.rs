//! Burrow agent
//!
//! Dials out to a controller, advertises its configured endpoints, and
//! serves forwarded HTTP requests and remote commands from inside an
//! otherwise unreachable network.

mod cancel;
mod config;
mod exec;
mod http_exec;
mod tunnel;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::AgentConfig;
use crate::tunnel::TunnelClient;

/// Burrow agent - serves forwarded requests from inside a private network
#[derive(Parser, Debug)]
#[command(name = "burrow-agent")]
#[command(about = "Dials out to a burrow controller and serves forwarded requests")]
#[command(version)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "BURROW_AGENT_CONFIG", default_value = "/app/config/agent.yaml")]
    config: PathBuf,

    /// Controller host override
    #[arg(long, env = "BURROW_CONTROLLER_HOST")]
    host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut config = AgentConfig::load(&args.config)?;
    if let Some(host) = args.host {
        config.controller.host = host;
    }

    tracing::info!(
        controller = %config.controller.host,
        endpoints = config.endpoints.len(),
        "Starting agent"
    );

    let client = TunnelClient::new(config)?;
    client.run().await
}
