//! The controller's private certificate authority
//!
//! Keeps the CA key in memory; persistence of CA material is the host's
//! concern. All issued leaves carry the structured CN from [`crate::name`].

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};

use crate::name::CertificateName;
use crate::CertError;

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// A freshly issued certificate with its key and the CA that signed it,
/// all in PEM form.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

/// Private CA issuing burrow leaf certificates.
pub struct Authority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_pem: String,
}

impl Authority {
    /// Create a new CA with the given common name.
    pub fn create(common_name: &str) -> Result<Self, CertError> {
        let key = KeyPair::generate().map_err(generation)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));
        set_validity(&mut params, CA_VALIDITY_DAYS);

        let cert = params.self_signed(&key).map_err(generation)?;
        let ca_pem = cert.pem();

        Ok(Self {
            ca_cert: cert,
            ca_key: key,
            ca_pem,
        })
    }

    /// The CA certificate in PEM form, for distribution to peers.
    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    /// Issue a certificate for an agent dialing in to the tunnel port.
    pub fn issue_agent_cert(&self, agent: &str) -> Result<IssuedCert, CertError> {
        self.issue_leaf(
            &CertificateName::agent(agent),
            ExtendedKeyUsagePurpose::ClientAuth,
        )
    }

    /// Issue a certificate binding a client to one service endpoint of one
    /// agent.
    pub fn issue_service_cert(
        &self,
        agent: &str,
        endpoint_type: &str,
        name: &str,
    ) -> Result<IssuedCert, CertError> {
        self.issue_leaf(
            &CertificateName::service(agent, endpoint_type, name),
            ExtendedKeyUsagePurpose::ClientAuth,
        )
    }

    /// Issue a certificate for an operator tool or control-API client.
    pub fn issue_control_cert(&self, name: &str) -> Result<IssuedCert, CertError> {
        self.issue_leaf(
            &CertificateName::control(name),
            ExtendedKeyUsagePurpose::ClientAuth,
        )
    }

    /// Issue the controller's own server certificate, valid for the given
    /// hostnames plus the usual loopback names.
    pub fn issue_server_cert(&self, server_names: &[String]) -> Result<IssuedCert, CertError> {
        let key = KeyPair::generate().map_err(generation)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        let cn = server_names
            .first()
            .map(String::as_str)
            .unwrap_or("localhost");
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));
        set_validity(&mut params, LEAF_VALIDITY_DAYS);

        let mut sans = vec![
            san_dns("localhost")?,
            SanType::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
        ];
        for name in server_names {
            sans.push(san_dns(name)?);
        }
        params.subject_alt_names = sans;

        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .map_err(generation)?;

        Ok(IssuedCert {
            ca_pem: self.ca_pem.clone(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    fn issue_leaf(
        &self,
        name: &CertificateName,
        eku: ExtendedKeyUsagePurpose,
    ) -> Result<IssuedCert, CertError> {
        let cn = name.to_common_name()?;
        let key = KeyPair::generate().map_err(generation)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.extended_key_usages = vec![eku];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));
        set_validity(&mut params, LEAF_VALIDITY_DAYS);

        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .map_err(generation)?;

        Ok(IssuedCert {
            ca_pem: self.ca_pem.clone(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

fn set_validity(params: &mut CertificateParams, days: i64) {
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(days);
}

fn san_dns(name: &str) -> Result<SanType, CertError> {
    Ok(SanType::DnsName(Ia5String::try_from(name).map_err(
        |e| CertError::GenerationFailed(format!("bad server name '{name}': {e}")),
    )?))
}

fn generation(e: rcgen::Error) -> CertError {
    CertError::GenerationFailed(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::{parse_name_from_der, CertificatePurpose};
    use crate::material::certificates_from_pem;

    fn issued_name(issued: &IssuedCert) -> CertificateName {
        let ders = certificates_from_pem(&issued.cert_pem).unwrap();
        parse_name_from_der(&ders[0]).unwrap()
    }

    #[test]
    fn test_agent_cert_roundtrip() {
        let ca = Authority::create("test-ca").unwrap();
        let issued = ca.issue_agent_cert("east").unwrap();

        let name = issued_name(&issued);
        assert_eq!(name.purpose, CertificatePurpose::Agent);
        assert_eq!(name.agent.as_deref(), Some("east"));
        assert!(name.endpoint_type.is_none());
        assert!(name.name.is_none());
    }

    #[test]
    fn test_service_cert_roundtrip() {
        let ca = Authority::create("test-ca").unwrap();
        let issued = ca.issue_service_cert("east", "aws", "prod").unwrap();

        let name = issued_name(&issued);
        assert_eq!(name.purpose, CertificatePurpose::Service);
        assert_eq!(name.agent.as_deref(), Some("east"));
        assert_eq!(name.endpoint_type.as_deref(), Some("aws"));
        assert_eq!(name.name.as_deref(), Some("prod"));
    }

    #[test]
    fn test_control_cert_roundtrip() {
        let ca = Authority::create("test-ca").unwrap();
        let issued = ca.issue_control_cert("ops").unwrap();

        let name = issued_name(&issued);
        assert_eq!(name.purpose, CertificatePurpose::Control);
        assert_eq!(name.name.as_deref(), Some("ops"));
        assert!(name.agent.is_none());
    }

    #[test]
    fn test_dotted_component_rejected() {
        let ca = Authority::create("test-ca").unwrap();
        assert!(ca.issue_agent_cert("east.west").is_err());
    }

    #[test]
    fn test_issued_material_loads_into_rustls() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let ca = Authority::create("test-ca").unwrap();
        let issued = ca.issue_server_cert(&["controller.example.com".to_string()]).unwrap();

        let certs = certificates_from_pem(&issued.cert_pem).unwrap();
        let key = crate::material::private_key_from_pem(&issued.key_pem).unwrap();

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key);
        assert!(config.is_ok());
    }

    #[test]
    fn test_ca_pem_is_a_certificate() {
        let ca = Authority::create("test-ca").unwrap();
        assert!(ca.ca_pem().contains("BEGIN CERTIFICATE"));
        let ders = certificates_from_pem(ca.ca_pem()).unwrap();
        assert_eq!(ders.len(), 1);
    }
}
