//! Certificate authority and structured certificate names
//!
//! The controller runs a private CA. Every leaf certificate it issues
//! encodes a [`CertificateName`] in its CN, binding the holder to a purpose
//! (agent, service, or control) and, depending on the purpose, to an agent
//! name and endpoint tuple.

pub mod authority;
pub mod material;
pub mod name;

pub use authority::{Authority, IssuedCert};
pub use material::{certificates_from_pem, private_key_from_pem, root_store_from_pem};
pub use name::{
    common_name_from_der, first_label_from_der, parse_name_from_der, CertificateName,
    CertificatePurpose,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Invalid certificate name: {0}")]
    InvalidName(String),

    #[error("Certificate has no common name")]
    MissingCommonName,

    #[error("Malformed certificate: {0}")]
    MalformedCertificate(String),

    #[error("Invalid PEM material: {0}")]
    InvalidPem(String),
}
