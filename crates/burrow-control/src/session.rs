//! Per-tunnel session state

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use burrow_proto::{AgentMessage, Endpoint};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use ulid::Ulid;

/// Why an enqueue onto the session's outbound mailbox failed.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// The mailbox stayed full past the send timeout; the agent is slow.
    Backpressure,
    /// The session is closing or closed.
    Closed,
}

/// One connected agent tunnel.
///
/// The session owns the outbound mailbox feeding the tunnel's single writer
/// task and the inflight table routing agent frames back to per-transaction
/// mailboxes. Identity is fixed at handshake and immutable afterwards.
pub struct AgentSession {
    session_id: String,
    agent_name: String,
    hostname: String,
    version: String,
    endpoints: Vec<Endpoint>,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<AgentMessage>,
    inflight: DashMap<String, mpsc::UnboundedSender<AgentMessage>>,
    closed: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl AgentSession {
    /// Create a session for a freshly completed handshake. Returns the
    /// session and the receiving end of its outbound mailbox, which the
    /// tunnel's writer task drains.
    pub fn new(
        agent_name: String,
        hostname: String,
        version: String,
        endpoints: Vec<Endpoint>,
        write_queue: usize,
    ) -> (Arc<Self>, mpsc::Receiver<AgentMessage>) {
        let (tx, rx) = mpsc::channel(write_queue);
        let session = Arc::new(Self {
            session_id: Ulid::new().to_string(),
            agent_name,
            hostname,
            version,
            endpoints,
            connected_at: Utc::now(),
            outbound: tx,
            inflight: DashMap::new(),
            closed: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        });
        (session, rx)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Whether this session advertises a configured endpoint matching the
    /// tuple. An empty or absent name matches any endpoint of the type.
    pub fn advertises(&self, endpoint_type: &str, endpoint_name: Option<&str>) -> bool {
        self.endpoints.iter().any(|ep| {
            ep.configured
                && ep.endpoint_type == endpoint_type
                && match endpoint_name {
                    None | Some("") => true,
                    Some(name) => ep.name == name,
                }
        })
    }

    /// Register a per-transaction mailbox under `request_id`. If the session
    /// is already closing the mailbox comes back closed, so the caller
    /// observes peer-disconnected immediately.
    pub fn register_inflight(&self, request_id: &str) -> mpsc::UnboundedReceiver<AgentMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.closed.load(Ordering::Acquire) {
            return rx;
        }
        self.inflight.insert(request_id.to_string(), tx);
        // A close that raced the insert must not leave the entry behind.
        if self.closed.load(Ordering::Acquire) {
            self.inflight.remove(request_id);
        }
        rx
    }

    /// Drop the inflight entry, closing its mailbox.
    pub fn remove_inflight(&self, request_id: &str) -> bool {
        self.inflight.remove(request_id).is_some()
    }

    /// Route an agent frame to its transaction mailbox. Frames whose id is
    /// unknown are dropped: the transaction was already cancelled.
    pub fn route(&self, msg: AgentMessage) {
        let Some(id) = msg.request_id().map(str::to_string) else {
            return;
        };
        match self.inflight.get(&id) {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    drop(tx);
                    self.inflight.remove(&id);
                }
            }
            None => {
                tracing::trace!(
                    session = %self.session_id,
                    request_id = %id,
                    "Dropping frame for unknown transaction"
                );
            }
        }
    }

    /// Enqueue a controller-to-agent frame, waiting up to `timeout` for
    /// space in the mailbox. Blocking here blocks only this transaction.
    pub async fn enqueue(
        &self,
        msg: AgentMessage,
        timeout: Duration,
    ) -> Result<(), EnqueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EnqueueError::Closed);
        }
        match tokio::time::timeout(timeout, self.outbound.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(EnqueueError::Closed),
            Err(_) => Err(EnqueueError::Backpressure),
        }
    }

    /// Best-effort enqueue for keepalive traffic; a full mailbox drops it.
    pub fn try_enqueue(&self, msg: AgentMessage) {
        let _ = self.outbound.try_send(msg);
    }

    /// Record peer activity for the keepalive monitor.
    pub fn touch(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }

    /// Time since the peer was last heard from.
    pub fn idle(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// Close the session: every inflight mailbox closes, signalling
    /// peer-disconnected to its adapter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.inflight.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of live transactions on this session.
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::CommandChannel;

    fn endpoints() -> Vec<Endpoint> {
        vec![
            Endpoint {
                endpoint_type: "kubernetes".to_string(),
                name: "default".to_string(),
                configured: true,
                namespaces: Vec::new(),
            },
            Endpoint {
                endpoint_type: "jenkins".to_string(),
                name: "ci".to_string(),
                configured: false,
                namespaces: Vec::new(),
            },
        ]
    }

    fn session() -> (Arc<AgentSession>, mpsc::Receiver<AgentMessage>) {
        AgentSession::new(
            "east".to_string(),
            "host-1".to_string(),
            "0.3.0".to_string(),
            endpoints(),
            4,
        )
    }

    #[test]
    fn test_advertises_matching() {
        let (s, _rx) = session();
        assert!(s.advertises("kubernetes", Some("default")));
        assert!(s.advertises("kubernetes", Some("")));
        assert!(s.advertises("kubernetes", None));
        assert!(!s.advertises("kubernetes", Some("other")));
        // Unconfigured endpoints never match.
        assert!(!s.advertises("jenkins", Some("ci")));
        assert!(!s.advertises("aws", None));
    }

    #[tokio::test]
    async fn test_route_to_inflight_mailbox() {
        let (s, _rx) = session();
        let mut mailbox = s.register_inflight("req-1");

        s.route(AgentMessage::HttpResponse {
            id: "req-1".to_string(),
            status: 200,
            headers: Vec::new(),
            content_length: 0,
        });

        let frame = mailbox.recv().await.unwrap();
        assert!(matches!(frame, AgentMessage::HttpResponse { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_unknown_id_dropped() {
        let (s, _rx) = session();
        // No inflight entry; must not panic or leak.
        s.route(AgentMessage::CommandData {
            id: "ghost".to_string(),
            channel: CommandChannel::Stdout,
            body: Vec::new(),
            closed: true,
        });
        assert_eq!(s.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_close_closes_all_mailboxes() {
        let (s, _rx) = session();
        let mut m1 = s.register_inflight("a");
        let mut m2 = s.register_inflight("b");

        s.close();

        assert!(m1.recv().await.is_none());
        assert!(m2.recv().await.is_none());
        assert_eq!(s.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_register_after_close_is_closed() {
        let (s, _rx) = session();
        s.close();
        let mut mailbox = s.register_inflight("late");
        assert!(mailbox.recv().await.is_none());
        assert_eq!(s.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_backpressure() {
        let (s, _rx) = session();
        // Queue size is 4 and nothing drains it.
        for i in 0..4 {
            s.enqueue(
                AgentMessage::Ping { timestamp: i },
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        }
        let result = s
            .enqueue(
                AgentMessage::Ping { timestamp: 99 },
                Duration::from_millis(50),
            )
            .await;
        assert_eq!(result, Err(EnqueueError::Backpressure));
    }

    #[tokio::test]
    async fn test_enqueue_after_close() {
        let (s, _rx) = session();
        s.close();
        let result = s
            .enqueue(
                AgentMessage::Ping { timestamp: 1 },
                Duration::from_millis(50),
            )
            .await;
        assert_eq!(result, Err(EnqueueError::Closed));
    }

    #[test]
    fn test_session_ids_are_unique_and_sortable() {
        let (a, _ra) = session();
        let (b, _rb) = session();
        assert_ne!(a.session_id(), b.session_id());
        assert_eq!(a.session_id().len(), 26);
    }
}
