//! Shared TLS accept loop for the controller's HTTPS surfaces
//!
//! Each listener terminates TLS itself so the peer certificate is available
//! to request handling; axum does not surface it, so connections are served
//! with hyper directly.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::http_relay::RelayBody;

/// The DER bytes of the client's leaf certificate, when one was presented.
pub type PeerCert = Option<Vec<u8>>;

/// Accept TLS connections forever, serving HTTP/1.1 on each with the
/// peer certificate handed to every request.
pub async fn serve_tls<H, Fut>(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    handler: H,
) -> Result<()>
where
    H: Fn(PeerCert, Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<RelayBody>> + Send + 'static,
{
    let acceptor = TlsAcceptor::from(tls_config);

    loop {
        let (tcp, remote) = listener.accept().await.context("accept failed")?;
        let acceptor = acceptor.clone();
        let handler = handler.clone();

        tokio::spawn(async move {
            let tls = match acceptor.accept(tcp).await {
                Ok(tls) => tls,
                Err(e) => {
                    tracing::debug!(remote = %remote, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let peer_cert: PeerCert = tls
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.as_ref().to_vec());

            let service = service_fn(move |req: Request<Incoming>| {
                let handler = handler.clone();
                let peer_cert = peer_cert.clone();
                async move { Ok::<_, Infallible>(handler(peer_cert, req).await) }
            });

            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                tracing::debug!(remote = %remote, error = %e, "Connection ended with error");
            }
        });
    }
}
