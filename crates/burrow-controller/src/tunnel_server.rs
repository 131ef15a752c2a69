//! Agent tunnel listener
//!
//! Accepts mutually authenticated TLS connections from agents and hands
//! each one to the session driver.

use std::sync::Arc;

use anyhow::{Context, Result};
use burrow_cert::parse_name_from_der;
use burrow_control::{serve_agent_tunnel, AgentRegistry, TunnelConfig};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

pub async fn run(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    registry: Arc<AgentRegistry>,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "Running agent tunnel listener");
    let acceptor = TlsAcceptor::from(tls_config);

    loop {
        let (tcp, remote) = listener.accept().await.context("accept failed")?;
        let acceptor = acceptor.clone();
        let registry = registry.clone();

        tokio::spawn(async move {
            let tls = match acceptor.accept(tcp).await {
                Ok(tls) => tls,
                Err(e) => {
                    tracing::debug!(remote = %remote, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let peer = tls
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| parse_name_from_der(cert.as_ref()));

            let peer = match peer {
                Some(Ok(name)) => name,
                Some(Err(e)) => {
                    tracing::warn!(remote = %remote, error = %e, "Rejecting tunnel: bad certificate name");
                    return;
                }
                None => {
                    tracing::warn!(remote = %remote, "Rejecting tunnel: no client certificate");
                    return;
                }
            };

            if let Err(e) =
                serve_agent_tunnel(tls, peer, registry, TunnelConfig::default()).await
            {
                tracing::warn!(remote = %remote, error = %e, "Tunnel session failed");
            }
        });
    }
}
