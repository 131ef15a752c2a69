//! Burrow controller
//!
//! Accepts inbound HTTPS and command traffic, and routes each request over
//! a persistent tunnel to one of the connected agents.

mod cmdtool_server;
mod cnc;
mod config;
mod health;
mod http_relay;
mod kubernetes_server;
mod serve;
mod service_server;
mod tls;
mod tunnel_server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use burrow_auth::Keyset;
use burrow_cert::Authority;
use burrow_control::AgentRegistry;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cnc::CncState;
use crate::config::ControllerConfig;
use crate::tls::{server_config, ClientAuth};

/// Burrow controller - routes inbound requests over reverse tunnels to agents
#[derive(Parser, Debug)]
#[command(name = "burrow-controller")]
#[command(about = "Routes inbound requests over reverse tunnels to agents in private networks")]
#[command(version)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "BURROW_CONFIG", default_value = "/app/config/config.yaml")]
    config: PathBuf,

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

    let config = Arc::new(ControllerConfig::load(&args.config)?);
    config.dump();

    let keyset = Arc::new(Keyset::from_keys(
        config
            .jwt
            .keys
            .iter()
            .map(|(kid, secret)| (kid.clone(), secret.clone().into_bytes())),
        &config.jwt.current_key,
    )?);

    let authority = Arc::new(Authority::create("burrow-controller-ca")?);

    tracing::info!("Generating a server certificate");
    let server_cert = authority.issue_server_cert(&config.server_names)?;

    let registry = Arc::new(AgentRegistry::new());

    let mutual_tls = server_config(&server_cert, authority.ca_pem(), ClientAuth::Required)?;
    let optional_tls = server_config(&server_cert, authority.ca_pem(), ClientAuth::Optional)?;

    let bind = |port: u16| -> Result<SocketAddr> {
        format!("{}:{}", config.bind_addr, port)
            .parse()
            .context("invalid bind address")
    };

    let agent_listener = TcpListener::bind(bind(config.agent_port)?).await?;
    let cmdtool_listener = TcpListener::bind(bind(config.cmdtool_port)?).await?;
    let service_listener = TcpListener::bind(bind(config.service_port)?).await?;
    let kubernetes_listener = TcpListener::bind(bind(config.kubernetes_api_port)?).await?;
    let control_listener = TcpListener::bind(bind(config.control_port)?).await?;
    let health_addr = bind(config.health_port)?;

    let cnc_state = Arc::new(CncState {
        authority: authority.clone(),
        keyset: keyset.clone(),
        registry: registry.clone(),
        config: config.clone(),
    });

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(tunnel_server::run(
        agent_listener,
        mutual_tls.clone(),
        registry.clone(),
    ));
    tasks.spawn(cmdtool_server::run(
        cmdtool_listener,
        mutual_tls.clone(),
        registry.clone(),
    ));
    tasks.spawn(service_server::run(
        service_listener,
        optional_tls,
        registry.clone(),
        keyset.clone(),
    ));
    tasks.spawn(kubernetes_server::run(
        kubernetes_listener,
        mutual_tls.clone(),
        registry.clone(),
    ));
    tasks.spawn(cnc::run(control_listener, mutual_tls, cnc_state));
    tasks.spawn(health::run(health_addr));

    tokio::select! {
        result = tasks.join_next() => {
            if let Some(result) = result {
                result.context("listener task panicked")??;
            }
            anyhow::bail!("a listener exited unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down; open tunnel sessions will close");
        }
    }

    Ok(())
}
