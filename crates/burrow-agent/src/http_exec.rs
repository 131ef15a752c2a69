//! Agent-side HTTP execution
//!
//! Executes a forwarded `HttpRequest` against the local endpoint it names
//! and streams the response back as a head frame plus chunked body frames.
//! Each configured endpoint gets its own client honoring that endpoint's
//! TLS settings.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use burrow_proto::{AgentMessage, HttpHeader, CONTENT_LENGTH_CHUNKED};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::mpsc;

use crate::cancel::CancelTable;
use crate::config::EndpointConfig;

struct EndpointClient {
    client: reqwest::Client,
    base_url: String,
}

/// One HTTP client per configured endpoint, keyed by (type, name).
pub struct EndpointClients {
    clients: HashMap<(String, String), EndpointClient>,
}

impl EndpointClients {
    pub fn build(endpoints: &[EndpointConfig]) -> Result<Self> {
        let mut clients = HashMap::new();
        for ep in endpoints {
            let client = build_client(ep)
                .with_context(|| format!("building client for endpoint ({}, {})", ep.endpoint_type, ep.name))?;
            clients.insert(
                (ep.endpoint_type.clone(), ep.name.clone()),
                EndpointClient {
                    client,
                    base_url: ep.url.trim_end_matches('/').to_string(),
                },
            );
        }
        Ok(Self { clients })
    }

    /// Find the endpoint a request names. An empty name matches any
    /// endpoint of the type, mirroring the controller's selection rule.
    fn find(&self, endpoint_type: &str, endpoint_name: &str) -> Option<&EndpointClient> {
        if !endpoint_name.is_empty() {
            return self
                .clients
                .get(&(endpoint_type.to_string(), endpoint_name.to_string()));
        }
        self.clients
            .iter()
            .find(|((t, _), _)| t == endpoint_type)
            .map(|(_, c)| c)
    }
}

fn build_client(ep: &EndpointConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().use_rustls_tls();

    if let Some(tls) = &ep.tls {
        if let Some(ca_file) = &tls.ca_file {
            let pem = std::fs::read(ca_file)
                .with_context(|| format!("reading {}", ca_file.display()))?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        if let (Some(cert_file), Some(key_file)) = (&tls.cert_file, &tls.key_file) {
            let mut identity = std::fs::read(cert_file)
                .with_context(|| format!("reading {}", cert_file.display()))?;
            identity.extend(
                std::fs::read(key_file)
                    .with_context(|| format!("reading {}", key_file.display()))?,
            );
            builder = builder.identity(reqwest::Identity::from_pem(&identity)?);
        }
        if tls.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
    }

    Ok(builder.build()?)
}

fn request_headers(headers: &[HttpHeader]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for header in headers {
        // Host tracks the endpoint URL; lengths come from the buffered body.
        if header.name.eq_ignore_ascii_case("host")
            || header.name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        let Ok(name) = HeaderName::try_from(header.name.as_str()) else {
            continue;
        };
        for value in &header.values {
            if let Ok(value) = HeaderValue::try_from(value.as_str()) {
                map.append(&name, value);
            }
        }
    }
    map
}

fn response_headers(headers: &HeaderMap) -> Vec<HttpHeader> {
    let mut out = Vec::new();
    for name in headers.keys() {
        let values: Vec<String> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        if !values.is_empty() {
            out.push(HttpHeader {
                name: name.as_str().to_string(),
                values,
            });
        }
    }
    out
}

async fn send_failure(out: &mpsc::Sender<AgentMessage>, id: &str) {
    let _ = out
        .send(AgentMessage::HttpResponse {
            id: id.to_string(),
            status: 502,
            headers: Vec::new(),
            content_length: 0,
        })
        .await;
}

/// Execute one forwarded HTTP request.
#[allow(clippy::too_many_arguments)]
pub async fn handle_http_request(
    clients: Arc<EndpointClients>,
    out: mpsc::Sender<AgentMessage>,
    cancels: CancelTable,
    id: String,
    endpoint_type: String,
    endpoint_name: String,
    method: String,
    uri: String,
    headers: Vec<HttpHeader>,
    body: Vec<u8>,
) {
    let registration = cancels.register(&id);
    let token = registration.token();

    let Some(endpoint) = clients.find(&endpoint_type, &endpoint_name) else {
        tracing::warn!(
            request_id = %id,
            endpoint_type = %endpoint_type,
            endpoint_name = %endpoint_name,
            "Request for unknown endpoint"
        );
        send_failure(&out, &id).await;
        return;
    };

    let Ok(method) = reqwest::Method::from_bytes(method.as_bytes()) else {
        send_failure(&out, &id).await;
        return;
    };

    let url = format!("{}{}", endpoint.base_url, uri);
    let request = endpoint
        .client
        .request(method, &url)
        .headers(request_headers(&headers))
        .body(body);

    let mut response = tokio::select! {
        _ = token.cancelled() => {
            tracing::debug!(request_id = %id, "Request cancelled before dispatch");
            return;
        }
        result = request.send() => match result {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(request_id = %id, url = %url, error = %e, "Local request failed");
                send_failure(&out, &id).await;
                return;
            }
        },
    };

    let content_length = match response.content_length() {
        Some(0) => 0,
        Some(n) => n as i64,
        None => CONTENT_LENGTH_CHUNKED,
    };

    let head = AgentMessage::HttpResponse {
        id: id.clone(),
        status: response.status().as_u16(),
        headers: response_headers(response.headers()),
        content_length,
    };
    if out.send(head).await.is_err() {
        return;
    }
    if content_length == 0 {
        return;
    }

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!(request_id = %id, "Request cancelled mid-body");
                return;
            }
            chunk = response.chunk() => {
                let frame = match chunk {
                    Ok(Some(bytes)) => AgentMessage::HttpChunkedResponse {
                        id: id.clone(),
                        body: bytes.to_vec(),
                    },
                    Ok(None) => {
                        let _ = out
                            .send(AgentMessage::HttpChunkedResponse {
                                id: id.clone(),
                                body: Vec::new(),
                            })
                            .await;
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(request_id = %id, error = %e, "Body read failed mid-stream");
                        let _ = out
                            .send(AgentMessage::HttpChunkedResponse {
                                id: id.clone(),
                                body: Vec::new(),
                            })
                            .await;
                        return;
                    }
                };
                if out.send(frame).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(endpoint_type: &str, name: &str) -> EndpointConfig {
        EndpointConfig {
            endpoint_type: endpoint_type.to_string(),
            name: name.to_string(),
            url: "https://localhost:1/".to_string(),
            namespaces: Vec::new(),
            tls: None,
        }
    }

    #[test]
    fn test_find_exact_and_wildcard() {
        let clients = EndpointClients::build(&[
            endpoint("kubernetes", "default"),
            endpoint("jenkins", "ci"),
        ])
        .unwrap();

        assert!(clients.find("kubernetes", "default").is_some());
        assert!(clients.find("kubernetes", "").is_some());
        assert!(clients.find("kubernetes", "other").is_none());
        assert!(clients.find("aws", "").is_none());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let clients = EndpointClients::build(&[endpoint("kubernetes", "default")]).unwrap();
        let ep = clients.find("kubernetes", "default").unwrap();
        assert_eq!(ep.base_url, "https://localhost:1");
    }

    #[test]
    fn test_request_headers_skip_host_and_invalid() {
        let headers = vec![
            HttpHeader {
                name: "Host".to_string(),
                values: vec!["example.com".to_string()],
            },
            HttpHeader {
                name: "Content-Length".to_string(),
                values: vec!["42".to_string()],
            },
            HttpHeader {
                name: "X-Ok".to_string(),
                values: vec!["1".to_string(), "2".to_string()],
            },
            HttpHeader {
                name: "Bad Header Name".to_string(),
                values: vec!["x".to_string()],
            },
        ];
        let map = request_headers(&headers);
        assert!(map.get("host").is_none());
        assert!(map.get("content-length").is_none());
        assert_eq!(map.get_all("x-ok").iter().count(), 2);
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_reports_bad_gateway() {
        let clients = Arc::new(EndpointClients::build(&[]).unwrap());
        let (tx, mut rx) = mpsc::channel(4);
        handle_http_request(
            clients,
            tx,
            CancelTable::new(),
            "req-1".to_string(),
            "kubernetes".to_string(),
            "default".to_string(),
            "GET".to_string(),
            "/api".to_string(),
            Vec::new(),
            Vec::new(),
        )
        .await;

        let frame = rx.recv().await.unwrap();
        assert!(matches!(
            frame,
            AgentMessage::HttpResponse {
                status: 502,
                content_length: 0,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_bad_gateway() {
        let clients =
            Arc::new(EndpointClients::build(&[endpoint("kubernetes", "default")]).unwrap());
        let (tx, mut rx) = mpsc::channel(4);
        handle_http_request(
            clients,
            tx,
            CancelTable::new(),
            "req-2".to_string(),
            "kubernetes".to_string(),
            "default".to_string(),
            "GET".to_string(),
            "/api".to_string(),
            Vec::new(),
            Vec::new(),
        )
        .await;

        let frame = rx.recv().await.unwrap();
        assert!(matches!(
            frame,
            AgentMessage::HttpResponse { status: 502, .. }
        ));
    }
}
