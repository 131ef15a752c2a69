//! Kubernetes API HTTPS listener
//!
//! Mutual TLS only. The first label of the client certificate's CN is taken
//! as the agent name and the request is dispatched to any configured
//! kubernetes endpoint of that agent.

use std::sync::Arc;

use burrow_cert::first_label_from_der;
use burrow_control::{AgentRegistry, AgentSearch};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use tokio::net::TcpListener;

use crate::http_relay::{relay, status_response, RelayBody};
use crate::serve::{serve_tls, PeerCert};

async fn handle(
    registry: Arc<AgentRegistry>,
    peer_cert: PeerCert,
    req: Request<Incoming>,
) -> Response<RelayBody> {
    let agent = peer_cert
        .as_deref()
        .and_then(|der| first_label_from_der(der).ok())
        .filter(|label| !label.is_empty());

    let Some(agent) = agent else {
        return status_response(StatusCode::BAD_REQUEST);
    };

    let search = AgentSearch {
        name: Some(agent),
        endpoint_type: Some("kubernetes".to_string()),
        endpoint_name: None,
    };
    relay(registry, search, req).await
}

pub async fn run(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    registry: Arc<AgentRegistry>,
) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "Running Kubernetes API HTTPS listener");
    serve_tls(listener, tls_config, move |peer_cert, req| {
        let registry = registry.clone();
        handle(registry, peer_cert, req)
    })
    .await
}
