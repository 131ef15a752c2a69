//! PEM to rustls material conversion

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;

use crate::CertError;

/// Parse every certificate in a PEM bundle.
pub fn certificates_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| CertError::InvalidPem(e.to_string()))?;
    if certs.is_empty() {
        return Err(CertError::InvalidPem("no certificates found".to_string()));
    }
    Ok(certs)
}

/// Parse the first private key in a PEM bundle.
pub fn private_key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>, CertError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| CertError::InvalidPem(e.to_string()))?
        .ok_or_else(|| CertError::InvalidPem("no private key found".to_string()))
}

/// Build a root store trusting every certificate in the bundle.
pub fn root_store_from_pem(pem: &str) -> Result<RootCertStore, CertError> {
    let mut roots = RootCertStore::empty();
    for cert in certificates_from_pem(pem)? {
        roots
            .add(cert)
            .map_err(|e| CertError::InvalidPem(e.to_string()))?;
    }
    Ok(roots)
}
