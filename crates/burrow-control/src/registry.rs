//! Registry of connected agent sessions and request dispatch
//!
//! Registration, deregistration and lookup serialize on one lock so a
//! lookup never observes a half-registered session. Dispatch is read-heavy;
//! the lock is only held while picking a session, never across an await.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use burrow_proto::{AgentMessage, Endpoint};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::{AgentSession, EnqueueError};

/// Default time a dispatch may wait on a full outbound mailbox.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Query selecting an agent session for a transaction.
#[derive(Debug, Clone, Default)]
pub struct AgentSearch {
    /// Restrict to sessions of this agent.
    pub name: Option<String>,
    /// Require a configured endpoint of this type.
    pub endpoint_type: Option<String>,
    /// Endpoint name; `None` or empty matches any endpoint of the type.
    pub endpoint_name: Option<String>,
}

impl AgentSearch {
    /// Search for an agent by name alone (command dispatch).
    pub fn by_agent(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Search for an endpoint of a specific agent (HTTP dispatch).
    pub fn endpoint(
        name: impl Into<String>,
        endpoint_type: impl Into<String>,
        endpoint_name: impl Into<String>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            endpoint_type: Some(endpoint_type.into()),
            endpoint_name: Some(endpoint_name.into()),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no eligible agent session")]
    NotFound,

    #[error("agent session outbound queue full")]
    Backpressure,

    #[error("agent session closed")]
    SessionClosed,
}

/// Statistics reported for one connected session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatistics {
    pub agent_name: String,
    pub session: String,
    pub hostname: String,
    pub version: String,
    pub connected_at: DateTime<Utc>,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Default)]
struct Inner {
    by_name: HashMap<String, Vec<Arc<AgentSession>>>,
    by_id: HashMap<String, Arc<AgentSession>>,
}

/// Index of connected agent sessions.
pub struct AgentRegistry {
    inner: RwLock<Inner>,
    send_timeout: Duration,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Override the dispatch backpressure timeout (tests mostly).
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Publish a session that completed its handshake.
    pub fn register(&self, session: Arc<AgentSession>) {
        let mut inner = self.inner.write().unwrap();
        inner
            .by_name
            .entry(session.agent_name().to_string())
            .or_default()
            .push(session.clone());
        inner
            .by_id
            .insert(session.session_id().to_string(), session.clone());

        tracing::info!(
            agent = %session.agent_name(),
            session = %session.session_id(),
            hostname = %session.hostname(),
            endpoints = session.endpoints().len(),
            "Registered agent session"
        );
    }

    /// Remove a session from the index. The caller closes the session after
    /// deregistration so no lookup can hand it out mid-teardown.
    pub fn deregister(&self, session_id: &str) -> Option<Arc<AgentSession>> {
        let mut inner = self.inner.write().unwrap();
        let session = inner.by_id.remove(session_id)?;

        let name = session.agent_name().to_string();
        if let Some(list) = inner.by_name.get_mut(&name) {
            list.retain(|s| s.session_id() != session_id);
            if list.is_empty() {
                inner.by_name.remove(&name);
            }
        }

        tracing::info!(
            agent = %name,
            session = %session_id,
            "Deregistered agent session"
        );
        Some(session)
    }

    /// Pick one eligible session for the query, uniformly at random.
    pub fn search(&self, query: &AgentSearch) -> Option<Arc<AgentSession>> {
        let inner = self.inner.read().unwrap();

        let candidates: Vec<&Arc<AgentSession>> = match &query.name {
            Some(name) => inner
                .by_name
                .get(name)
                .map(|list| list.iter().collect())
                .unwrap_or_default(),
            None => inner.by_name.values().flatten().collect(),
        };

        let eligible: Vec<&Arc<AgentSession>> = candidates
            .into_iter()
            .filter(|s| match &query.endpoint_type {
                Some(et) => s.advertises(et, query.endpoint_name.as_deref()),
                None => true,
            })
            .collect();

        eligible
            .choose(&mut rand::thread_rng())
            .map(|s| Arc::clone(s))
    }

    /// Look up a session by its id, for directed cancellation.
    pub fn get(&self, session_id: &str) -> Option<Arc<AgentSession>> {
        self.inner.read().unwrap().by_id.get(session_id).cloned()
    }

    /// Bind a transaction to an eligible session and enqueue its opening
    /// frame. Returns the chosen session id and the transaction mailbox.
    ///
    /// The session id is returned so a later cancel can be directed at the
    /// same session even if the eligible set has changed since.
    pub async fn send(
        &self,
        query: &AgentSearch,
        request_id: &str,
        msg: AgentMessage,
    ) -> Result<(String, mpsc::UnboundedReceiver<AgentMessage>), DispatchError> {
        let session = self.search(query).ok_or(DispatchError::NotFound)?;

        let mailbox = session.register_inflight(request_id);
        match session.enqueue(msg, self.send_timeout).await {
            Ok(()) => Ok((session.session_id().to_string(), mailbox)),
            Err(e) => {
                session.remove_inflight(request_id);
                Err(match e {
                    EnqueueError::Backpressure => DispatchError::Backpressure,
                    EnqueueError::Closed => DispatchError::SessionClosed,
                })
            }
        }
    }

    /// Cancel a transaction on a specific session: the inflight entry
    /// closes first so frames in flight are dropped on arrival, then the
    /// agent is told to abort. A no-op when the session is already gone.
    pub async fn cancel(&self, session_id: &str, request_id: &str) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        session.remove_inflight(request_id);
        let cancel = AgentMessage::CancelRequest {
            id: request_id.to_string(),
        };
        if session.enqueue(cancel, self.send_timeout).await.is_err() {
            tracing::debug!(
                session = %session_id,
                request_id = %request_id,
                "Session gone before cancel could be delivered"
            );
        }
    }

    /// Number of connected sessions.
    pub fn count(&self) -> usize {
        self.inner.read().unwrap().by_id.len()
    }

    /// Statistics for every connected session, sorted by session id.
    pub fn statistics(&self) -> Vec<AgentStatistics> {
        let inner = self.inner.read().unwrap();
        let mut stats: Vec<AgentStatistics> = inner
            .by_id
            .values()
            .map(|s| AgentStatistics {
                agent_name: s.agent_name().to_string(),
                session: s.session_id().to_string(),
                hostname: s.hostname().to_string(),
                version: s.version().to_string(),
                connected_at: s.connected_at(),
                endpoints: s.endpoints().to_vec(),
            })
            .collect();
        stats.sort_by(|a, b| a.session.cmp(&b.session));
        stats
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session(
        agent: &str,
        endpoints: Vec<(&str, &str, bool)>,
    ) -> (Arc<AgentSession>, mpsc::Receiver<AgentMessage>) {
        let endpoints = endpoints
            .into_iter()
            .map(|(t, n, configured)| Endpoint {
                endpoint_type: t.to_string(),
                name: n.to_string(),
                configured,
                namespaces: Vec::new(),
            })
            .collect();
        AgentSession::new(
            agent.to_string(),
            "host".to_string(),
            "0.3.0".to_string(),
            endpoints,
            8,
        )
    }

    #[test]
    fn test_register_and_search_by_endpoint() {
        let registry = AgentRegistry::new();
        let (s, _rx) = make_session("east", vec![("kubernetes", "default", true)]);
        registry.register(s.clone());

        let query = AgentSearch::endpoint("east", "kubernetes", "default");
        let found = registry.search(&query).unwrap();
        assert_eq!(found.session_id(), s.session_id());
    }

    #[test]
    fn test_search_empty_name_matches_any_of_type() {
        let registry = AgentRegistry::new();
        let (s, _rx) = make_session("east", vec![("kubernetes", "default", true)]);
        registry.register(s);

        let query = AgentSearch::endpoint("east", "kubernetes", "");
        assert!(registry.search(&query).is_some());
    }

    #[test]
    fn test_search_skips_unconfigured() {
        let registry = AgentRegistry::new();
        let (s, _rx) = make_session("east", vec![("kubernetes", "default", false)]);
        registry.register(s);

        let query = AgentSearch::endpoint("east", "kubernetes", "default");
        assert!(registry.search(&query).is_none());
    }

    #[test]
    fn test_search_wrong_agent() {
        let registry = AgentRegistry::new();
        let (s, _rx) = make_session("east", vec![("kubernetes", "default", true)]);
        registry.register(s);

        let query = AgentSearch::endpoint("west", "kubernetes", "default");
        assert!(registry.search(&query).is_none());
    }

    #[test]
    fn test_search_by_agent_ignores_endpoints() {
        let registry = AgentRegistry::new();
        let (s, _rx) = make_session("east", vec![]);
        registry.register(s);

        assert!(registry.search(&AgentSearch::by_agent("east")).is_some());
    }

    #[test]
    fn test_selection_is_among_eligible() {
        let registry = AgentRegistry::new();
        let (a, _ra) = make_session("east", vec![("kubernetes", "default", true)]);
        let (b, _rb) = make_session("east", vec![("kubernetes", "default", true)]);
        let (c, _rc) = make_session("east", vec![("aws", "prod", true)]);
        registry.register(a.clone());
        registry.register(b.clone());
        registry.register(c.clone());

        let query = AgentSearch::endpoint("east", "kubernetes", "default");
        for _ in 0..32 {
            let picked = registry.search(&query).unwrap();
            assert_ne!(picked.session_id(), c.session_id());
        }
    }

    #[test]
    fn test_deregister_removes_from_both_indexes() {
        let registry = AgentRegistry::new();
        let (s, _rx) = make_session("east", vec![("kubernetes", "default", true)]);
        let id = s.session_id().to_string();
        registry.register(s);
        assert_eq!(registry.count(), 1);

        assert!(registry.deregister(&id).is_some());
        assert_eq!(registry.count(), 0);
        assert!(registry.get(&id).is_none());
        assert!(registry
            .search(&AgentSearch::by_agent("east"))
            .is_none());

        // Deregistering again is a no-op.
        assert!(registry.deregister(&id).is_none());
    }

    #[tokio::test]
    async fn test_send_not_found() {
        let registry = AgentRegistry::new();
        let query = AgentSearch::endpoint("east", "kubernetes", "missing");
        let result = registry
            .send(&query, "req-1", AgentMessage::Ping { timestamp: 0 })
            .await;
        assert!(matches!(result, Err(DispatchError::NotFound)));
    }

    #[tokio::test]
    async fn test_send_delivers_and_registers_inflight() {
        let registry = AgentRegistry::new();
        let (s, mut out_rx) = make_session("east", vec![("kubernetes", "default", true)]);
        registry.register(s.clone());

        let query = AgentSearch::endpoint("east", "kubernetes", "default");
        let msg = AgentMessage::HttpRequest {
            id: "req-1".to_string(),
            endpoint_type: "kubernetes".to_string(),
            endpoint_name: "default".to_string(),
            method: "GET".to_string(),
            uri: "/api".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        };
        let (session_id, mut mailbox) = registry.send(&query, "req-1", msg.clone()).await.unwrap();
        assert_eq!(session_id, s.session_id());

        // The frame reached the outbound mailbox unchanged.
        assert_eq!(out_rx.recv().await, Some(msg));

        // Frames routed by the session land in the transaction mailbox.
        s.route(AgentMessage::HttpResponse {
            id: "req-1".to_string(),
            status: 200,
            headers: Vec::new(),
            content_length: 0,
        });
        assert!(mailbox.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_send_backpressure_unregisters_inflight() {
        let registry = AgentRegistry::new().with_send_timeout(Duration::from_millis(50));
        let (s, _out_rx) = make_session("east", vec![("kubernetes", "default", true)]);
        registry.register(s.clone());

        // Fill the outbound queue; nothing drains it.
        for i in 0..8 {
            s.try_enqueue(AgentMessage::Ping { timestamp: i });
        }

        let query = AgentSearch::endpoint("east", "kubernetes", "default");
        let result = registry
            .send(&query, "req-1", AgentMessage::Ping { timestamp: 99 })
            .await;
        assert!(matches!(result, Err(DispatchError::Backpressure)));
        assert_eq!(s.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_removes_inflight_and_notifies_agent() {
        let registry = AgentRegistry::new();
        let (s, mut out_rx) = make_session("east", vec![("kubernetes", "default", true)]);
        registry.register(s.clone());

        let query = AgentSearch::endpoint("east", "kubernetes", "default");
        let (session_id, mut mailbox) = registry
            .send(&query, "req-1", AgentMessage::Ping { timestamp: 0 })
            .await
            .unwrap();
        let _ = out_rx.recv().await;

        registry.cancel(&session_id, "req-1").await;

        // Mailbox closed locally.
        assert!(mailbox.recv().await.is_none());
        // CancelRequest enqueued to the agent.
        assert_eq!(
            out_rx.recv().await,
            Some(AgentMessage::CancelRequest {
                id: "req-1".to_string()
            })
        );

        // Frames arriving after the cancel are dropped.
        s.route(AgentMessage::HttpResponse {
            id: "req-1".to_string(),
            status: 200,
            headers: Vec::new(),
            content_length: 0,
        });
        assert_eq!(s.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_session_is_noop() {
        let registry = AgentRegistry::new();
        registry.cancel("no-such-session", "req-1").await;
    }

    #[test]
    fn test_statistics() {
        let registry = AgentRegistry::new();
        let (a, _ra) = make_session("east", vec![("kubernetes", "default", true)]);
        let (b, _rb) = make_session("west", vec![("aws", "prod", true)]);
        registry.register(a);
        registry.register(b);

        let stats = registry.statistics();
        assert_eq!(stats.len(), 2);
        let names: Vec<&str> = stats.iter().map(|s| s.agent_name.as_str()).collect();
        assert!(names.contains(&"east"));
        assert!(names.contains(&"west"));
    }
}
