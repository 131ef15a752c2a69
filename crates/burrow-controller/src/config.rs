//! Controller configuration

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_agent_port() -> u16 {
    9001
}

fn default_cmdtool_port() -> u16 {
    9002
}

fn default_service_port() -> u16 {
    9003
}

fn default_kubernetes_port() -> u16 {
    9004
}

fn default_control_port() -> u16 {
    9005
}

fn default_health_port() -> u16 {
    9090
}

fn default_server_names() -> Vec<String> {
    vec!["localhost".to_string()]
}

/// JWT keyset configuration: named HMAC secrets plus the key new tokens are
/// signed with.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub current_key: String,
    pub keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Hostnames the controller's server certificate is valid for.
    #[serde(default = "default_server_names")]
    pub server_names: Vec<String>,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Agent tunnel port (mutual TLS, agent certs).
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    /// Tool tunnel port (mutual TLS, control certs).
    #[serde(default = "default_cmdtool_port")]
    pub cmdtool_port: u16,

    /// Service HTTPS port (service certs or Basic+JWT).
    #[serde(default = "default_service_port")]
    pub service_port: u16,

    /// Kubernetes API HTTPS port (service certs).
    #[serde(default = "default_kubernetes_port")]
    pub kubernetes_api_port: u16,

    /// Control REST port (mutual TLS, control certs).
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Plain HTTP health port.
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Hostname advertised to agents in generated manifests; defaults to
    /// the first server name.
    #[serde(default)]
    pub agent_hostname: Option<String>,

    pub jwt: JwtConfig,
}

impl ControllerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ControllerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn agent_hostname(&self) -> &str {
        self.agent_hostname
            .as_deref()
            .or_else(|| self.server_names.first().map(String::as_str))
            .unwrap_or("localhost")
    }

    pub fn service_url(&self) -> String {
        format!("https://{}:{}", self.agent_hostname(), self.service_port)
    }

    pub fn control_url(&self) -> String {
        format!("https://{}:{}", self.agent_hostname(), self.control_port)
    }

    pub fn dump(&self) {
        tracing::info!(server_names = ?self.server_names, "Server names");
        tracing::info!(
            agent = self.agent_port,
            cmdtool = self.cmdtool_port,
            service = self.service_port,
            kubernetes_api = self.kubernetes_api_port,
            control = self.control_port,
            health = self.health_port,
            "Listener ports"
        );
    }
}
