//! Protocol message types

use serde::{Deserialize, Serialize};

/// `HttpResponse.content_length` value signalling a chunked body: the body
/// arrives as `HttpChunkedResponse` frames terminated by an empty one.
pub const CONTENT_LENGTH_CHUNKED: i64 = -1;

/// A service endpoint advertised by an agent.
///
/// The tuple `(endpoint_type, name)` is unique within one agent session,
/// although multiple agents (even sharing an agent name) may advertise the
/// same endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Coarse protocol category, e.g. "kubernetes", "aws", "jenkins"
    pub endpoint_type: String,
    /// Operator-chosen instance label
    pub name: String,
    /// Whether the agent considers this endpoint live
    pub configured: bool,
    /// Optional list of sub-resources this endpoint serves
    #[serde(default)]
    pub namespaces: Vec<String>,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.endpoint_type, self.name, self.configured
        )
    }
}

/// One HTTP header and its values, as carried over the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub values: Vec<String>,
}

/// Output channel of a remotely executed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandChannel {
    Stdin,
    Stdout,
    Stderr,
}

/// Frames exchanged between the controller and an agent, in both directions.
///
/// Every frame belonging to a transaction carries the `id` the controller
/// assigned when it dispatched the request; the agent echoes it in every
/// subsequent frame for that transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentMessage {
    Ping {
        timestamp: u64,
    },
    PingResponse {
        timestamp: u64,
    },
    /// First frame an agent sends after the TLS handshake.
    AgentHello {
        endpoints: Vec<Endpoint>,
        hostname: String,
        version: String,
    },
    HttpRequest {
        id: String,
        endpoint_type: String,
        /// Empty matches any configured endpoint of `endpoint_type`.
        endpoint_name: String,
        method: String,
        uri: String,
        headers: Vec<HttpHeader>,
        #[serde(with = "serde_bytes")]
        body: Vec<u8>,
    },
    CancelRequest {
        id: String,
    },
    /// Response head. `content_length` of 0 means the transaction is done
    /// after headers; a negative value means a chunked body follows.
    HttpResponse {
        id: String,
        status: u16,
        headers: Vec<HttpHeader>,
        content_length: i64,
    },
    /// One body chunk. An empty body terminates the transaction.
    HttpChunkedResponse {
        id: String,
        #[serde(with = "serde_bytes")]
        body: Vec<u8>,
    },
    CommandRequest {
        id: String,
        name: String,
        arguments: Vec<String>,
        /// NAME=value pairs; replaces the child's environment wholesale.
        environment: Vec<String>,
    },
    /// Command output. `closed` marks EOF on that channel; no further data
    /// frames for the channel may follow.
    CommandData {
        id: String,
        channel: CommandChannel,
        #[serde(with = "serde_bytes")]
        body: Vec<u8>,
        closed: bool,
    },
    /// Final frame of a command transaction. Both stdout and stderr must
    /// have been closed before this is sent.
    CommandTermination {
        id: String,
        exit_code: i32,
        message: String,
    },
}

impl AgentMessage {
    /// Transaction id carried by this frame, if any. Frames without an id
    /// (ping traffic, hello) are handled by the session itself.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            AgentMessage::HttpRequest { id, .. }
            | AgentMessage::CancelRequest { id }
            | AgentMessage::HttpResponse { id, .. }
            | AgentMessage::HttpChunkedResponse { id, .. }
            | AgentMessage::CommandRequest { id, .. }
            | AgentMessage::CommandData { id, .. }
            | AgentMessage::CommandTermination { id, .. } => Some(id),
            AgentMessage::Ping { .. }
            | AgentMessage::PingResponse { .. }
            | AgentMessage::AgentHello { .. } => None,
        }
    }

    /// Build an `AgentHello` with this host's metadata filled in.
    pub fn hello(endpoints: Vec<Endpoint>) -> Self {
        AgentMessage::AgentHello {
            endpoints,
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Frames exchanged between a cmdtool and the controller.
///
/// Same semantics as the command frames of [`AgentMessage`], but stripped of
/// the transaction id and target: the controller assigns both from the
/// authenticated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolMessage {
    CommandRequest {
        name: String,
        arguments: Vec<String>,
        environment: Vec<String>,
    },
    CommandData {
        channel: CommandChannel,
        #[serde(with = "serde_bytes")]
        body: Vec<u8>,
        closed: bool,
    },
    CommandTermination {
        exit_code: i32,
        message: String,
    },
}

// Compact byte-slice encoding for body payloads
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
