//! Burrow cmdtool
//!
//! Runs one command on a remote agent through the controller's tool tunnel
//! and exits with the remote exit code. Output frames are written straight
//! to the local stdout and stderr.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use burrow_cert::{certificates_from_pem, private_key_from_pem, root_store_from_pem};
use burrow_proto::{CommandChannel, MessageStream, ToolMessage};
use clap::Parser;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Run a command on a remote agent through the burrow controller
#[derive(Parser, Debug)]
#[command(name = "burrow-cmdtool")]
#[command(about = "Run a command on a remote agent through the burrow controller")]
#[command(version)]
struct Args {
    /// Certificate used to connect to the controller
    #[arg(long, default_value = "tls.crt")]
    cert_file: PathBuf,

    /// Key for the certificate
    #[arg(long, default_value = "tls.key")]
    key_file: PathBuf,

    /// CA certificate used to verify the controller
    #[arg(long, default_value = "ca.pem")]
    ca_cert_file: PathBuf,

    /// Controller host and tool port
    #[arg(long, default_value = "localhost:9002")]
    host: String,

    /// The remote command name to run
    #[arg(long)]
    cmd: String,

    /// Environment variable as NAME=value (repeatable)
    #[arg(long = "env", value_parser = parse_env)]
    env: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Arguments passed to the remote command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn parse_env(value: &str) -> Result<String, String> {
    if !value.contains('=') {
        return Err("syntax: NAME=value".to_string());
    }
    Ok(value.to_string())
}

async fn connect(args: &Args) -> Result<MessageStream<tokio_rustls::client::TlsStream<TcpStream>>> {
    let ca_pem = std::fs::read_to_string(&args.ca_cert_file)
        .with_context(|| format!("reading {}", args.ca_cert_file.display()))?;
    let cert_pem = std::fs::read_to_string(&args.cert_file)
        .with_context(|| format!("reading {}", args.cert_file.display()))?;
    let key_pem = std::fs::read_to_string(&args.key_file)
        .with_context(|| format!("reading {}", args.key_file.display()))?;

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store_from_pem(&ca_pem)?)
        .with_client_auth_cert(
            certificates_from_pem(&cert_pem)?,
            private_key_from_pem(&key_pem)?,
        )
        .context("assembling client TLS config")?;

    let host = args
        .host
        .split(':')
        .next()
        .unwrap_or("localhost")
        .to_string();
    let tcp = TcpStream::connect(&args.host)
        .await
        .with_context(|| format!("connecting to {}", args.host))?;
    let server_name = ServerName::try_from(host).context("invalid controller host name")?;
    let tls = TlsConnector::from(Arc::new(tls_config))
        .connect(server_name, tcp)
        .await
        .context("TLS handshake failed")?;

    Ok(MessageStream::new(tls))
}

async fn run(args: Args) -> Result<i32> {
    let mut stream = connect(&args).await?;

    stream
        .send(&ToolMessage::CommandRequest {
            name: args.cmd.clone(),
            arguments: args.args.clone(),
            environment: args.env.clone(),
        })
        .await
        .context("sending command request")?;

    let stdout = std::io::stdout();
    let stderr = std::io::stderr();

    loop {
        let frame = stream
            .recv::<ToolMessage>()
            .await
            .context("reading from controller")?;
        match frame {
            Some(ToolMessage::CommandData { channel, body, .. }) => match channel {
                CommandChannel::Stdout | CommandChannel::Stdin => {
                    let mut out = stdout.lock();
                    out.write_all(&body)?;
                    out.flush()?;
                }
                CommandChannel::Stderr => {
                    let mut err = stderr.lock();
                    err.write_all(&body)?;
                    err.flush()?;
                }
            },
            Some(ToolMessage::CommandTermination { exit_code, message }) => {
                if !message.is_empty() {
                    eprintln!("{message}");
                }
                return Ok(exit_code);
            }
            Some(ToolMessage::CommandRequest { .. }) => {
                anyhow::bail!("unexpected command request from controller");
            }
            None => {
                anyhow::bail!("connection closed before command finished");
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    match run(args).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_syntax_enforced() {
        assert!(parse_env("NAME=value").is_ok());
        assert!(parse_env("NAME=").is_ok());
        assert!(parse_env("NAME").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "burrow-cmdtool",
            "--host",
            "controller:9002",
            "--cmd",
            "ls",
            "--env",
            "A=1",
            "--env",
            "B=2",
            "-l",
        ]);
        assert_eq!(args.cmd, "ls");
        assert_eq!(args.env, vec!["A=1", "B=2"]);
        assert_eq!(args.args, vec!["-l"]);
    }
}
