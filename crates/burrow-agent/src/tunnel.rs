//! Controller tunnel client
//!
//! Dials the controller over mutually authenticated TLS, sends the hello,
//! then serves forwarded requests until the stream breaks. The caller wraps
//! this in a reconnect loop.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use burrow_cert::{certificates_from_pem, private_key_from_pem, root_store_from_pem};
use burrow_proto::stream::split_stream;
use burrow_proto::AgentMessage;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;

use crate::cancel::CancelTable;
use crate::config::AgentConfig;
use crate::exec;
use crate::http_exec::{handle_http_request, EndpointClients};

const WRITE_QUEUE: usize = 64;

pub struct TunnelClient {
    config: Arc<AgentConfig>,
    clients: Arc<EndpointClients>,
    cancels: CancelTable,
    tls: TlsConnector,
}

impl TunnelClient {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let clients = EndpointClients::build(&config.endpoints)?;

        let ca_pem = std::fs::read_to_string(&config.identity.ca_file)
            .with_context(|| format!("reading {}", config.identity.ca_file.display()))?;
        let cert_pem = std::fs::read_to_string(&config.identity.cert_file)
            .with_context(|| format!("reading {}", config.identity.cert_file.display()))?;
        let key_pem = std::fs::read_to_string(&config.identity.key_file)
            .with_context(|| format!("reading {}", config.identity.key_file.display()))?;

        let roots = root_store_from_pem(&ca_pem)?;
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(
                certificates_from_pem(&cert_pem)?,
                private_key_from_pem(&key_pem)?,
            )
            .context("assembling client TLS config")?;

        Ok(Self {
            config: Arc::new(config),
            clients: Arc::new(clients),
            cancels: CancelTable::new(),
            tls: TlsConnector::from(Arc::new(tls_config)),
        })
    }

    /// Connect and serve until the controller goes away, reconnecting with
    /// a flat backoff.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.run_once().await {
                Ok(()) => tracing::info!("Controller closed the tunnel"),
                Err(e) => tracing::warn!(error = %e, "Tunnel failed"),
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
            tracing::info!("Reconnecting");
        }
    }

    async fn run_once(&self) -> Result<()> {
        let host = self.config.controller.host.clone();
        let addr = format!("{}:{}", host, self.config.controller.port);
        tracing::info!(addr = %addr, "Connecting to controller");

        let tcp = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        let server_name =
            ServerName::try_from(host.clone()).context("controller host is not a valid name")?;
        let tls = self
            .tls
            .connect(server_name, tcp)
            .await
            .context("TLS handshake with controller failed")?;

        let (mut source, mut sink) = split_stream(tls);
        let (out_tx, mut out_rx) = mpsc::channel::<AgentMessage>(WRITE_QUEUE);

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(&msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.shutdown().await;
        });

        out_tx
            .send(AgentMessage::hello(self.config.advertised_endpoints()))
            .await
            .ok();
        tracing::info!(
            endpoints = self.config.endpoints.len(),
            "Connected; hello sent"
        );

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.controller.tick_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let result = loop {
            tokio::select! {
                frame = source.recv::<AgentMessage>() => match frame {
                    Ok(Some(msg)) => self.dispatch(msg, &out_tx),
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(anyhow::Error::from(e)),
                },
                _ = ticker.tick() => {
                    if out_tx.send(AgentMessage::Ping { timestamp: now_millis() }).await.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        drop(out_tx);
        let _ = writer.await;
        result
    }

    fn dispatch(&self, msg: AgentMessage, out: &mpsc::Sender<AgentMessage>) {
        match msg {
            AgentMessage::Ping { timestamp } => {
                let out = out.clone();
                tokio::spawn(async move {
                    let _ = out.send(AgentMessage::PingResponse { timestamp }).await;
                });
            }
            AgentMessage::PingResponse { .. } => {}
            AgentMessage::HttpRequest {
                id,
                endpoint_type,
                endpoint_name,
                method,
                uri,
                headers,
                body,
            } => {
                tokio::spawn(handle_http_request(
                    self.clients.clone(),
                    out.clone(),
                    self.cancels.clone(),
                    id,
                    endpoint_type,
                    endpoint_name,
                    method,
                    uri,
                    headers,
                    body,
                ));
            }
            AgentMessage::CommandRequest {
                id,
                name,
                arguments,
                environment,
            } => {
                tokio::spawn(exec::run_command(
                    out.clone(),
                    self.cancels.clone(),
                    id,
                    name,
                    arguments,
                    environment,
                ));
            }
            AgentMessage::CancelRequest { id } => {
                self.cancels.cancel(&id);
            }
            other => {
                tracing::debug!(frame = ?other, "Ignoring unexpected frame from controller");
            }
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
