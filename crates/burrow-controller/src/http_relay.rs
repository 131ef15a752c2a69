//! Inbound HTTP to tunnel frame relay
//!
//! Turns one inbound HTTPS request into an `HttpRequest` frame, then drives
//! the response state machine over the transaction mailbox: a `HttpResponse`
//! head, optionally followed by chunked body frames terminated by an empty
//! one. Chunks are flushed to the caller as they arrive.

use std::convert::Infallible;
use std::sync::Arc;

use burrow_control::{AgentRegistry, AgentSearch};
use burrow_proto::{AgentMessage, HttpHeader};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{HeaderName, HeaderValue, ACCEPT_ENCODING};
use hyper::{HeaderMap, Request, Response, StatusCode};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use ulid::Ulid;

/// Body type every controller HTTP surface responds with.
pub type RelayBody = BoxBody<Bytes, Infallible>;

pub fn empty_body() -> RelayBody {
    Empty::<Bytes>::new().boxed()
}

pub fn full_body(data: impl Into<Bytes>) -> RelayBody {
    Full::new(data.into()).boxed()
}

pub fn status_response(status: StatusCode) -> Response<RelayBody> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = status;
    resp
}

pub fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<RelayBody> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

/// Cancels the transaction on drop unless the response ran to completion.
///
/// The inbound caller disconnecting makes hyper drop the service future or
/// the streaming body, which drops this guard and propagates the cancel to
/// the owning session.
struct CancelGuard {
    registry: Arc<AgentRegistry>,
    session_id: String,
    request_id: String,
    armed: bool,
}

impl CancelGuard {
    fn new(registry: Arc<AgentRegistry>, session_id: String, request_id: String) -> Self {
        Self {
            registry,
            session_id,
            request_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let registry = self.registry.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let request_id = std::mem::take(&mut self.request_id);
        tokio::spawn(async move {
            registry.cancel(&session_id, &request_id).await;
        });
    }
}

/// Convert inbound headers to tunnel headers, dropping `Accept-Encoding` so
/// the agent-side client negotiates its own encoding.
fn tunnel_headers(headers: &HeaderMap) -> Vec<HttpHeader> {
    let mut out = Vec::new();
    for name in headers.keys() {
        if name == ACCEPT_ENCODING {
            continue;
        }
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

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "transfer-encoding" | "keep-alive" | "proxy-connection" | "te" | "trailer" | "upgrade"
    )
}

/// Relay one inbound request to an eligible agent session and stream the
/// response back.
pub async fn relay<B>(
    registry: Arc<AgentRegistry>,
    search: AgentSearch,
    req: Request<B>,
) -> Response<RelayBody>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();

    // Inbound bodies are buffered whole; they are bounded by the HTTPS
    // server's limits.
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed reading inbound request body");
            return status_response(StatusCode::BAD_REQUEST);
        }
    };

    let request_id = Ulid::new().to_string();
    let uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let frame = AgentMessage::HttpRequest {
        id: request_id.clone(),
        endpoint_type: search.endpoint_type.clone().unwrap_or_default(),
        endpoint_name: search.endpoint_name.clone().unwrap_or_default(),
        method: parts.method.as_str().to_string(),
        uri,
        headers: tunnel_headers(&parts.headers),
        body: body.to_vec(),
    };

    let (session_id, mut mailbox) = match registry.send(&search, &request_id, frame).await {
        Ok(bound) => bound,
        Err(e) => {
            tracing::warn!(error = %e, agent = ?search.name, "Dispatch failed");
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    let mut guard = CancelGuard::new(registry, session_id, request_id.clone());

    // Response head: the first frame must be HttpResponse.
    let (status, headers, content_length) = loop {
        match mailbox.recv().await {
            Some(AgentMessage::HttpResponse {
                status,
                headers,
                content_length,
                ..
            }) => break (status, headers, content_length),
            Some(AgentMessage::HttpChunkedResponse { .. }) => {
                tracing::warn!(request_id = %request_id, "Chunked frame before response head");
                return status_response(StatusCode::BAD_GATEWAY);
            }
            Some(other) => {
                tracing::debug!(frame = ?other, "Ignoring unexpected frame before head");
            }
            None => {
                // Peer closed before any headers were delivered.
                guard.disarm();
                return status_response(StatusCode::BAD_GATEWAY);
            }
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    // The response starts from a clean header map; only agent headers are
    // copied, minus hop-by-hop ones. The controller's own writer produces
    // chunked framing based solely on content_length.
    for header in &headers {
        if is_hop_by_hop(&header.name) {
            continue;
        }
        let Ok(name) = HeaderName::try_from(header.name.as_str()) else {
            continue;
        };
        for value in &header.values {
            if let Ok(value) = HeaderValue::try_from(value.as_str()) {
                builder = builder.header(&name, value);
            }
        }
    }

    if content_length == 0 {
        guard.disarm();
        return builder
            .body(empty_body())
            .unwrap_or_else(|_| status_response(StatusCode::BAD_GATEWAY));
    }

    // Body frames stream through a channel so each chunk reaches the
    // inbound caller as soon as it arrives.
    let (body_tx, body_rx) = mpsc::channel::<Result<Frame<Bytes>, Infallible>>(16);
    tokio::spawn(async move {
        loop {
            match mailbox.recv().await {
                Some(AgentMessage::HttpChunkedResponse { body, .. }) => {
                    if body.is_empty() {
                        guard.disarm();
                        break;
                    }
                    if body_tx.send(Ok(Frame::data(Bytes::from(body)))).await.is_err() {
                        // Inbound caller went away; the guard cancels.
                        break;
                    }
                }
                Some(other) => {
                    tracing::debug!(frame = ?other, "Ignoring unexpected frame in body");
                }
                None => {
                    // Session died mid-body: the stream ends prematurely and
                    // the caller observes the truncation.
                    break;
                }
            }
        }
    });

    let stream = ReceiverStream::new(body_rx);
    builder
        .body(StreamBody::new(stream).boxed())
        .unwrap_or_else(|_| status_response(StatusCode::BAD_GATEWAY))
}
