//! Agent configuration

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burrow_proto::Endpoint;
use serde::Deserialize;

fn default_controller_port() -> u16 {
    9001
}

fn default_tick_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerSection {
    /// Controller hostname.
    pub host: String,
    #[serde(default = "default_controller_port")]
    pub port: u16,
    /// Seconds between agent-initiated pings.
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
}

/// Files holding the agent certificate issued by the controller's CA.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentitySection {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
}

/// TLS settings for one local endpoint target.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointTls {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    #[serde(rename = "type")]
    pub endpoint_type: String,
    pub name: String,
    /// Base URL of the local service, e.g. https://kubernetes.default:6443
    pub url: String,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub tls: Option<EndpointTls>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub controller: ControllerSection,
    pub identity: IdentitySection,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: AgentConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        if config.endpoints.is_empty() {
            tracing::warn!("No endpoints configured; only remote commands will be served");
        }
        Ok(config)
    }

    /// The endpoints advertised in the hello frame.
    pub fn advertised_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .map(|ep| Endpoint {
                endpoint_type: ep.endpoint_type.clone(),
                name: ep.name.clone(),
                configured: true,
                namespaces: ep.namespaces.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
controller:
  host: controller.example.com
  port: 19001
identity:
  cert_file: /etc/burrow/tls.crt
  key_file: /etc/burrow/tls.key
  ca_file: /etc/burrow/ca.pem
endpoints:
  - type: kubernetes
    name: default
    url: https://kubernetes.docker.internal:6443
    namespaces: [default, kube-system]
    tls:
      ca_file: /etc/burrow/k8s-ca.pem
      insecure: false
  - type: jenkins
    name: ci
    url: https://jenkins.internal:8443
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.controller.port, 19001);
        assert_eq!(config.controller.tick_seconds, 30);
        assert_eq!(config.endpoints.len(), 2);

        let endpoints = config.advertised_endpoints();
        assert!(endpoints.iter().all(|ep| ep.configured));
        assert_eq!(endpoints[0].endpoint_type, "kubernetes");
        assert_eq!(endpoints[0].namespaces, vec!["default", "kube-system"]);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
controller:
  host: localhost
identity:
  cert_file: tls.crt
  key_file: tls.key
  ca_file: ca.pem
"#
        )
        .unwrap();

        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.controller.host, "localhost");
        assert_eq!(config.controller.port, 9001);
        assert!(config.endpoints.is_empty());
    }
}
