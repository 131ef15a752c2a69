//! Control REST API
//!
//! Credential minting and fleet statistics, gated by a control-purpose
//! client certificate. All credential responses carry PEM material as
//! base64 so they paste cleanly into manifests and kubeconfigs.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use burrow_auth::Keyset;
use burrow_cert::{parse_name_from_der, Authority, CertificatePurpose, IssuedCert};
use burrow_control::{AgentRegistry, AgentStatistics};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;

use crate::config::ControllerConfig;
use crate::http_relay::{json_response, RelayBody};
use crate::serve::{serve_tls, PeerCert};

pub const KUBECONFIG_ENDPOINT: &str = "/api/v1/generateKubectlComponents";
pub const MANIFEST_ENDPOINT: &str = "/api/v1/generateAgentManifestComponents";
pub const SERVICE_ENDPOINT: &str = "/api/v1/generateServiceCredentials";
pub const CONTROL_ENDPOINT: &str = "/api/v1/generateControlCredentials";
pub const STATISTICS_ENDPOINT: &str = "/api/v1/statistics";

pub struct CncState {
    pub authority: Arc<Authority>,
    pub keyset: Arc<Keyset>,
    pub registry: Arc<AgentRegistry>,
    pub config: Arc<ControllerConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeConfigRequest {
    agent_name: String,
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KubeConfigResponse {
    agent_name: String,
    name: String,
    #[serde(rename = "serverURL")]
    server_url: String,
    user_certificate: String,
    user_key: String,
    ca_cert: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestRequest {
    agent_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestResponse {
    agent_name: String,
    server_hostname: String,
    server_port: u16,
    agent_certificate: String,
    agent_key: String,
    ca_cert: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceCredentialRequest {
    agent_name: String,
    #[serde(rename = "type")]
    endpoint_type: String,
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged, rename_all = "camelCase")]
enum Credential {
    Basic {
        username: String,
        password: String,
    },
    Aws {
        #[serde(rename = "awsAccessKey")]
        aws_access_key: String,
        #[serde(rename = "awsSecretAccessKey")]
        aws_secret_access_key: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceCredentialResponse {
    agent_name: String,
    name: String,
    #[serde(rename = "type")]
    endpoint_type: String,
    url: String,
    ca_cert: String,
    credential_type: String,
    credential: Credential,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlCredentialsRequest {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ControlCredentialsResponse {
    name: String,
    url: String,
    certificate: String,
    key: String,
    ca_cert: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatisticsResponse {
    server_time: i64,
    version: String,
    connected_agents: Vec<AgentStatistics>,
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response<RelayBody> {
    json_response(status, &json!({"error": message.to_string()}))
}

fn require(field: &str, value: &str) -> Result<(), Response<RelayBody>> {
    if value.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            format!("'{field}' is required"),
        ));
    }
    Ok(())
}

fn encoded(issued: &IssuedCert) -> (String, String, String) {
    (
        BASE64.encode(&issued.ca_pem),
        BASE64.encode(&issued.cert_pem),
        BASE64.encode(&issued.key_pem),
    )
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, Response<RelayBody>> {
    serde_json::from_slice(body).map_err(|e| error_response(StatusCode::BAD_REQUEST, e))
}

fn generate_kubectl(state: &CncState, body: &Bytes) -> Response<RelayBody> {
    let req: KubeConfigRequest = match parse_body(body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    if let Err(resp) = require("agentName", &req.agent_name) {
        return resp;
    }
    if let Err(resp) = require("name", &req.name) {
        return resp;
    }

    let issued = match state
        .authority
        .issue_service_cert(&req.agent_name, "kubernetes", &req.name)
    {
        Ok(issued) => issued,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let (ca64, cert64, key64) = encoded(&issued);

    let resp = KubeConfigResponse {
        agent_name: req.agent_name,
        name: req.name,
        server_url: state.config.service_url(),
        user_certificate: cert64,
        user_key: key64,
        ca_cert: ca64,
    };
    json_response(StatusCode::OK, &json!(resp))
}

fn generate_manifest(state: &CncState, body: &Bytes) -> Response<RelayBody> {
    let req: ManifestRequest = match parse_body(body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    if let Err(resp) = require("agentName", &req.agent_name) {
        return resp;
    }

    let issued = match state.authority.issue_agent_cert(&req.agent_name) {
        Ok(issued) => issued,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let (ca64, cert64, key64) = encoded(&issued);

    let resp = ManifestResponse {
        agent_name: req.agent_name,
        server_hostname: state.config.agent_hostname().to_string(),
        server_port: state.config.agent_port,
        agent_certificate: cert64,
        agent_key: key64,
        ca_cert: ca64,
    };
    json_response(StatusCode::OK, &json!(resp))
}

fn generate_service_credentials(state: &CncState, body: &Bytes) -> Response<RelayBody> {
    let req: ServiceCredentialRequest = match parse_body(body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    for (field, value) in [
        ("agentName", &req.agent_name),
        ("type", &req.endpoint_type),
        ("name", &req.name),
    ] {
        if let Err(resp) = require(field, value) {
            return resp;
        }
    }

    let token = match state
        .keyset
        .mint_current(&req.endpoint_type, &req.name, &req.agent_name)
    {
        Ok(token) => token,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    let username = format!("{}.{}", req.name, req.agent_name);
    let (credential_type, credential) = match req.endpoint_type.as_str() {
        "aws" => (
            "aws".to_string(),
            Credential::Aws {
                aws_access_key: username,
                aws_secret_access_key: token,
            },
        ),
        _ => (
            "basic".to_string(),
            Credential::Basic {
                username,
                password: token,
            },
        ),
    };

    let resp = ServiceCredentialResponse {
        agent_name: req.agent_name,
        name: req.name,
        endpoint_type: req.endpoint_type,
        url: state.config.service_url(),
        ca_cert: BASE64.encode(state.authority.ca_pem()),
        credential_type,
        credential,
    };
    json_response(StatusCode::OK, &json!(resp))
}

fn generate_control_credentials(state: &CncState, body: &Bytes) -> Response<RelayBody> {
    let req: ControlCredentialsRequest = match parse_body(body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    if let Err(resp) = require("name", &req.name) {
        return resp;
    }

    let issued = match state.authority.issue_control_cert(&req.name) {
        Ok(issued) => issued,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let (ca64, cert64, key64) = encoded(&issued);

    let resp = ControlCredentialsResponse {
        name: req.name,
        url: state.config.control_url(),
        certificate: cert64,
        key: key64,
        ca_cert: ca64,
    };
    json_response(StatusCode::OK, &json!(resp))
}

fn statistics(state: &CncState) -> Response<RelayBody> {
    let resp = StatisticsResponse {
        server_time: chrono::Utc::now().timestamp_millis(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connected_agents: state.registry.statistics(),
    };
    json_response(StatusCode::OK, &json!(resp))
}

/// Route one authenticated request.
fn dispatch(state: &CncState, method: &Method, path: &str, body: &Bytes) -> Response<RelayBody> {
    match (method.as_str(), path) {
        ("POST", KUBECONFIG_ENDPOINT) => generate_kubectl(state, body),
        ("POST", MANIFEST_ENDPOINT) => generate_manifest(state, body),
        ("POST", SERVICE_ENDPOINT) => generate_service_credentials(state, body),
        ("POST", CONTROL_ENDPOINT) => generate_control_credentials(state, body),
        ("GET", STATISTICS_ENDPOINT) => statistics(state),
        (
            _,
            KUBECONFIG_ENDPOINT | MANIFEST_ENDPOINT | SERVICE_ENDPOINT | CONTROL_ENDPOINT
            | STATISTICS_ENDPOINT,
        ) => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn handle(
    state: Arc<CncState>,
    peer_cert: PeerCert,
    req: Request<Incoming>,
) -> Response<RelayBody> {
    // Only control certificates may use this surface.
    let authorized = peer_cert
        .as_deref()
        .and_then(|der| parse_name_from_der(der).ok())
        .map(|name| name.purpose == CertificatePurpose::Control)
        .unwrap_or(false);
    if !authorized {
        return error_response(
            StatusCode::FORBIDDEN,
            "certificate is not authorized for 'control'",
        );
    }

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    dispatch(&state, &parts.method, parts.uri.path(), &body)
}

pub async fn run(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    state: Arc<CncState>,
) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "Running control API HTTPS listener");
    serve_tls(listener, tls_config, move |peer_cert, req| {
        let state = state.clone();
        handle(state, peer_cert, req)
    })
    .await
}
