//! Service HTTPS listener
//!
//! Clients authenticate with a service certificate, or with HTTP Basic auth
//! where the password slot carries a service JWT. Either way the identity
//! binds the request to an `(agent, endpoint type, endpoint name)` tuple;
//! the certificate or token decides where the request may go, never the
//! request itself.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use burrow_auth::Keyset;
use burrow_cert::{parse_name_from_der, CertificatePurpose};
use burrow_control::{AgentRegistry, AgentSearch};
use hyper::body::Incoming;
use hyper::header::AUTHORIZATION;
use hyper::{HeaderMap, Request, Response, StatusCode};
use serde_json::json;
use tokio::net::TcpListener;

use crate::http_relay::{json_response, relay, RelayBody};
use crate::serve::{serve_tls, PeerCert};

/// Identity from a service certificate's CN.
fn identity_from_cert(peer_cert: &PeerCert) -> Option<AgentSearch> {
    let der = peer_cert.as_deref()?;
    let name = match parse_name_from_der(der) {
        Ok(name) => name,
        Err(e) => {
            tracing::debug!(error = %e, "Peer certificate has no structured name");
            return None;
        }
    };
    if name.purpose != CertificatePurpose::Service {
        return None;
    }
    Some(AgentSearch::endpoint(
        name.agent?,
        name.endpoint_type?,
        name.name?,
    ))
}

/// Identity from Basic auth whose password is a service JWT.
fn identity_from_jwt(headers: &HeaderMap, keyset: &Keyset) -> Option<AgentSearch> {
    let header = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (_user, password) = decoded.split_once(':')?;

    match keyset.verify(password) {
        Ok(identity) => Some(AgentSearch::endpoint(
            identity.agent,
            identity.endpoint_type,
            identity.endpoint_name,
        )),
        Err(e) => {
            tracing::debug!(error = %e, "Service token rejected");
            None
        }
    }
}

async fn handle(
    registry: Arc<AgentRegistry>,
    keyset: Arc<Keyset>,
    peer_cert: PeerCert,
    req: Request<Incoming>,
) -> Response<RelayBody> {
    let search =
        identity_from_cert(&peer_cert).or_else(|| identity_from_jwt(req.headers(), &keyset));

    let Some(search) = search else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &json!({"error": "no valid credentials or JWT found"}),
        );
    };

    relay(registry, search, req).await
}

pub async fn run(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    registry: Arc<AgentRegistry>,
    keyset: Arc<Keyset>,
) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "Running service HTTPS listener");
    serve_tls(listener, tls_config, move |peer_cert, req| {
        let registry = registry.clone();
        let keyset = keyset.clone();
        handle(registry, keyset, peer_cert, req)
    })
    .await
}
