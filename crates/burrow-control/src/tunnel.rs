//! Agent tunnel session driver
//!
//! One call to [`serve_agent_tunnel`] drives a single accepted stream
//! through its whole life: hello handshake, registration, reader and writer
//! loops, keepalive, and teardown. The stream type is generic so tests run
//! the same code over in-memory duplex pipes.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use burrow_cert::{CertificateName, CertificatePurpose};
use burrow_proto::stream::split_stream;
use burrow_proto::{AgentMessage, CodecError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::MissedTickBehavior;

use crate::registry::AgentRegistry;
use crate::session::AgentSession;

/// Tuning knobs for a tunnel session.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// How long to wait for the opening `AgentHello`.
    pub hello_timeout: Duration,
    /// Keepalive ping interval; silence for three intervals closes the
    /// session.
    pub keepalive: Duration,
    /// Outbound mailbox depth.
    pub write_queue: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            hello_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
            write_queue: 64,
        }
    }
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("peer certificate is not authorized for 'agent': {0}")]
    PermissionDenied(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Drive one accepted agent tunnel to completion.
///
/// Returns when the peer disconnects, misbehaves, or goes silent past the
/// keepalive budget. By the time this returns the session is deregistered
/// and every inflight mailbox is closed.
pub async fn serve_agent_tunnel<S>(
    io: S,
    peer: CertificateName,
    registry: Arc<AgentRegistry>,
    config: TunnelConfig,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    if peer.purpose != CertificatePurpose::Agent {
        return Err(TunnelError::PermissionDenied(peer.purpose.to_string()));
    }
    let agent_name = peer
        .agent
        .ok_or_else(|| TunnelError::PermissionDenied("certificate has no agent name".into()))?;

    let (mut source, mut sink) = split_stream(io);

    // First frame must be the hello, within the handshake budget.
    let hello = tokio::time::timeout(config.hello_timeout, source.recv::<AgentMessage>())
        .await
        .map_err(|_| TunnelError::Protocol("timed out waiting for AgentHello".into()))??;

    let (endpoints, hostname, version) = match hello {
        Some(AgentMessage::AgentHello {
            endpoints,
            hostname,
            version,
        }) => (endpoints, hostname, version),
        Some(other) => {
            return Err(TunnelError::Protocol(format!(
                "first frame was not AgentHello: {other:?}"
            )));
        }
        None => {
            return Err(TunnelError::Protocol(
                "stream closed before AgentHello".into(),
            ));
        }
    };

    let (session, mut outbound_rx) = AgentSession::new(
        agent_name.clone(),
        hostname,
        version,
        endpoints,
        config.write_queue,
    );
    let session_id = session.session_id().to_string();

    // Single writer task per session: frame order within a transaction is
    // the enqueue order.
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if let Err(e) = sink.send(&msg).await {
                tracing::debug!(error = %e, "Tunnel write failed");
                break;
            }
        }
        let _ = sink.shutdown().await;
    });

    registry.register(session.clone());

    let mut ping = tokio::time::interval(config.keepalive);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; the peer just completed its
    // handshake, so skip it.
    ping.tick().await;

    let result = loop {
        tokio::select! {
            frame = source.recv::<AgentMessage>() => match frame {
                Ok(Some(msg)) => {
                    session.touch();
                    match msg {
                        AgentMessage::Ping { timestamp } => {
                            session.try_enqueue(AgentMessage::PingResponse { timestamp });
                        }
                        AgentMessage::PingResponse { .. } => {}
                        AgentMessage::AgentHello { .. } => {
                            break Err(TunnelError::Protocol("repeated AgentHello".into()));
                        }
                        other => session.route(other),
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(TunnelError::Codec(e)),
            },
            _ = ping.tick() => {
                if session.idle() > config.keepalive * 3 {
                    tracing::warn!(
                        agent = %agent_name,
                        session = %session_id,
                        "No peer activity past keepalive budget, closing session"
                    );
                    break Ok(());
                }
                session.try_enqueue(AgentMessage::Ping { timestamp: now_millis() });
            }
        }
    };

    registry.deregister(&session_id);
    session.close();
    drop(session);
    let _ = writer.await;

    tracing::info!(agent = %agent_name, session = %session_id, "Tunnel session ended");
    result
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
