//! TLS server setup shared by the controller's listeners

use std::sync::Arc;

use anyhow::{Context, Result};
use burrow_cert::{certificates_from_pem, private_key_from_pem, root_store_from_pem, IssuedCert};
use rustls::server::WebPkiClientVerifier;
use rustls::ServerConfig;

/// Whether a listener demands a client certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    /// Handshake fails without a CA-signed client cert.
    Required,
    /// A client cert is verified when presented; requests may instead
    /// authenticate with a JWT.
    Optional,
}

/// Build a rustls server config trusting only our CA for client certs.
pub fn server_config(
    server_cert: &IssuedCert,
    ca_pem: &str,
    client_auth: ClientAuth,
) -> Result<Arc<ServerConfig>> {
    let roots = Arc::new(root_store_from_pem(ca_pem).context("loading CA roots")?);

    let builder = WebPkiClientVerifier::builder(roots);
    let verifier = match client_auth {
        ClientAuth::Required => builder.build(),
        ClientAuth::Optional => builder.allow_unauthenticated().build(),
    }
    .context("building client cert verifier")?;

    let certs = certificates_from_pem(&server_cert.cert_pem).context("loading server cert")?;
    let key = private_key_from_pem(&server_cert.key_pem).context("loading server key")?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("assembling server TLS config")?;

    Ok(Arc::new(config))
}
