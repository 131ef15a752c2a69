//! Structured certificate names
//!
//! The CN is a dotted label sequence with the purpose as the final label:
//!
//! ```text
//! <agent>.agent
//! <agent>.<type>.<name>.service
//! <name>.control
//! ```
//!
//! Labels may not contain dots; that is enforced when a certificate is
//! issued so parsing is unambiguous.

use crate::CertError;

/// What authority a certificate grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificatePurpose {
    /// An agent dialing in to the controller's tunnel port
    Agent,
    /// A client calling a service endpoint through the controller
    Service,
    /// An operator tool or control-API client
    Control,
}

impl CertificatePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificatePurpose::Agent => "agent",
            CertificatePurpose::Service => "service",
            CertificatePurpose::Control => "control",
        }
    }
}

impl std::fmt::Display for CertificatePurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The structured name carried in a leaf certificate's CN.
///
/// An `agent` certificate carries only the agent name; a `service`
/// certificate carries the agent name plus the endpoint tuple; a `control`
/// certificate carries only its own name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateName {
    pub purpose: CertificatePurpose,
    pub agent: Option<String>,
    pub endpoint_type: Option<String>,
    pub name: Option<String>,
}

impl CertificateName {
    pub fn agent(agent: impl Into<String>) -> Self {
        Self {
            purpose: CertificatePurpose::Agent,
            agent: Some(agent.into()),
            endpoint_type: None,
            name: None,
        }
    }

    pub fn service(
        agent: impl Into<String>,
        endpoint_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            purpose: CertificatePurpose::Service,
            agent: Some(agent.into()),
            endpoint_type: Some(endpoint_type.into()),
            name: Some(name.into()),
        }
    }

    pub fn control(name: impl Into<String>) -> Self {
        Self {
            purpose: CertificatePurpose::Control,
            agent: None,
            endpoint_type: None,
            name: Some(name.into()),
        }
    }

    /// Render the dotted CN. Fails if any label is empty or contains a dot.
    pub fn to_common_name(&self) -> Result<String, CertError> {
        let labels: Vec<&str> = match self.purpose {
            CertificatePurpose::Agent => vec![self.agent.as_deref().unwrap_or("")],
            CertificatePurpose::Service => vec![
                self.agent.as_deref().unwrap_or(""),
                self.endpoint_type.as_deref().unwrap_or(""),
                self.name.as_deref().unwrap_or(""),
            ],
            CertificatePurpose::Control => vec![self.name.as_deref().unwrap_or("")],
        };

        for label in &labels {
            validate_label(label)?;
        }

        let mut cn = labels.join(".");
        cn.push('.');
        cn.push_str(self.purpose.as_str());
        Ok(cn)
    }

    /// Parse a dotted CN back into a structured name.
    pub fn parse(cn: &str) -> Result<Self, CertError> {
        let labels: Vec<&str> = cn.split('.').collect();
        let (purpose, rest) = match labels.split_last() {
            Some((last, rest)) => (*last, rest),
            None => return Err(CertError::InvalidName(cn.to_string())),
        };

        for label in rest {
            if label.is_empty() {
                return Err(CertError::InvalidName(cn.to_string()));
            }
        }

        match (purpose, rest) {
            ("agent", [agent]) => Ok(CertificateName::agent(*agent)),
            ("service", [agent, endpoint_type, name]) => {
                Ok(CertificateName::service(*agent, *endpoint_type, *name))
            }
            ("control", [name]) => Ok(CertificateName::control(*name)),
            _ => Err(CertError::InvalidName(cn.to_string())),
        }
    }
}

fn validate_label(label: &str) -> Result<(), CertError> {
    if label.is_empty() {
        return Err(CertError::InvalidName("empty label".to_string()));
    }
    if label.contains('.') {
        return Err(CertError::InvalidName(format!(
            "label '{label}' may not contain '.'"
        )));
    }
    Ok(())
}

/// Read the CN out of a DER-encoded certificate, as presented by a TLS peer.
pub fn common_name_from_der(der: &[u8]) -> Result<String, CertError> {
    use x509_parser::prelude::{FromDer, X509Certificate};

    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| CertError::MalformedCertificate(e.to_string()))?;
    let result = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
        .ok_or(CertError::MissingCommonName);
    result
}

/// Parse the structured name out of a peer certificate.
pub fn parse_name_from_der(der: &[u8]) -> Result<CertificateName, CertError> {
    let cn = common_name_from_der(der)?;
    CertificateName::parse(&cn)
}

/// First dotted label of a peer certificate's CN.
///
/// The kubernetes API listener takes this as the agent name regardless of
/// the rest of the CN structure.
pub fn first_label_from_der(der: &[u8]) -> Result<String, CertError> {
    let cn = common_name_from_der(der)?;
    Ok(cn.split('.').next().unwrap_or("").to_string())
}
