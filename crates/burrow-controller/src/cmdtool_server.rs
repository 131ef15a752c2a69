//! Tool tunnel listener
//!
//! Short-lived streams from operator tools, gated by a control certificate.
//! The tool sends one stripped-down command request; the controller stamps
//! a fresh transaction id, derives the target agent from the certificate,
//! and bridges the command frames both ways.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use burrow_cert::{parse_name_from_der, CertificatePurpose};
use burrow_control::{AgentRegistry, AgentSearch};
use burrow_proto::stream::split_stream;
use burrow_proto::{AgentMessage, ToolMessage};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use ulid::Ulid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    registry: Arc<AgentRegistry>,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "Running tool tunnel listener");
    let acceptor = TlsAcceptor::from(tls_config);

    loop {
        let (tcp, remote) = listener.accept().await.context("accept failed")?;
        let acceptor = acceptor.clone();
        let registry = registry.clone();

        tokio::spawn(async move {
            let tls = match acceptor.accept(tcp).await {
                Ok(tls) => tls,
                Err(e) => {
                    tracing::debug!(remote = %remote, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let agent_name = {
                let peer = tls
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .map(|cert| parse_name_from_der(cert.as_ref()));
                match peer {
                    Some(Ok(name)) if name.purpose == CertificatePurpose::Control => {
                        match name.name {
                            Some(n) => n,
                            None => return,
                        }
                    }
                    _ => {
                        tracing::warn!(remote = %remote, "Rejecting tool: not a control certificate");
                        return;
                    }
                }
            };

            if let Err(e) = handle_tool(tls, agent_name, registry).await {
                tracing::debug!(remote = %remote, error = %e, "Tool stream ended");
            }
        });
    }
}

async fn handle_tool<S>(io: S, agent_name: String, registry: Arc<AgentRegistry>) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (mut source, mut sink) = split_stream(io);

    let first = tokio::time::timeout(REQUEST_TIMEOUT, source.recv::<ToolMessage>())
        .await
        .context("timed out waiting for command request")??;

    let Some(ToolMessage::CommandRequest {
        name,
        arguments,
        environment,
    }) = first
    else {
        anyhow::bail!("first frame was not a command request");
    };

    let request_id = Ulid::new().to_string();
    tracing::info!(
        agent = %agent_name,
        request_id = %request_id,
        command = %name,
        "Dispatching remote command"
    );

    let frame = AgentMessage::CommandRequest {
        id: request_id.clone(),
        name,
        arguments,
        environment,
    };

    let search = AgentSearch::by_agent(&agent_name);
    let (session_id, mut mailbox) = match registry.send(&search, &request_id, frame).await {
        Ok(bound) => bound,
        Err(e) => {
            let _ = sink
                .send(&ToolMessage::CommandTermination {
                    exit_code: 1,
                    message: format!("cannot reach agent '{agent_name}': {e}"),
                })
                .await;
            return Ok(());
        }
    };

    loop {
        tokio::select! {
            frame = mailbox.recv() => match frame {
                Some(AgentMessage::CommandData { channel, body, closed, .. }) => {
                    let out = ToolMessage::CommandData { channel, body, closed };
                    if sink.send(&out).await.is_err() {
                        registry.cancel(&session_id, &request_id).await;
                        return Ok(());
                    }
                }
                Some(AgentMessage::CommandTermination { exit_code, message, .. }) => {
                    let _ = sink
                        .send(&ToolMessage::CommandTermination { exit_code, message })
                        .await;
                    return Ok(());
                }
                Some(other) => {
                    tracing::debug!(frame = ?other, "Ignoring unexpected frame on tool bridge");
                }
                None => {
                    // Agent session died mid-command; the tool sees EOF.
                    let _ = sink.shutdown().await;
                    return Ok(());
                }
            },
            msg = source.recv::<ToolMessage>() => match msg {
                Ok(Some(_)) => {
                    tracing::debug!("Ignoring extra frame from tool");
                }
                _ => {
                    // Tool disconnected; abort the remote command.
                    registry.cancel(&session_id, &request_id).await;
                    return Ok(());
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_control::AgentSession;
    use burrow_proto::{CommandChannel, Endpoint, MessageStream};
    use tokio::sync::mpsc;

    fn registry_with_agent() -> (
        Arc<AgentRegistry>,
        Arc<AgentSession>,
        mpsc::Receiver<AgentMessage>,
    ) {
        let registry = Arc::new(AgentRegistry::new());
        let (session, out_rx) = AgentSession::new(
            "east".to_string(),
            "host".to_string(),
            "0.3.0".to_string(),
            vec![Endpoint {
                endpoint_type: "kubernetes".to_string(),
                name: "default".to_string(),
                configured: true,
                namespaces: Vec::new(),
            }],
            16,
        );
        registry.register(session.clone());
        (registry, session, out_rx)
    }

    #[tokio::test]
    async fn test_command_bridged_to_agent_and_back() {
        let (registry, session, mut out_rx) = registry_with_agent();

        let (tool_io, server_io) = tokio::io::duplex(16 * 1024);
        tokio::spawn(handle_tool(server_io, "east".to_string(), registry));

        // Fake agent: echo output frames for whatever command arrives.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let AgentMessage::CommandRequest { id, name, .. } = frame {
                    assert_eq!(name, "echo");
                    session.route(AgentMessage::CommandData {
                        id: id.clone(),
                        channel: CommandChannel::Stdout,
                        body: b"hi\n".to_vec(),
                        closed: false,
                    });
                    session.route(AgentMessage::CommandData {
                        id: id.clone(),
                        channel: CommandChannel::Stdout,
                        body: Vec::new(),
                        closed: true,
                    });
                    session.route(AgentMessage::CommandData {
                        id: id.clone(),
                        channel: CommandChannel::Stderr,
                        body: Vec::new(),
                        closed: true,
                    });
                    session.route(AgentMessage::CommandTermination {
                        id,
                        exit_code: 0,
                        message: String::new(),
                    });
                    break;
                }
            }
        });

        let mut tool = MessageStream::new(tool_io);
        tool.send(&ToolMessage::CommandRequest {
            name: "echo".to_string(),
            arguments: vec!["hi".to_string()],
            environment: Vec::new(),
        })
        .await
        .unwrap();

        let mut stdout = Vec::new();
        let mut closed_channels = 0;
        let exit_code = loop {
            match tool.recv::<ToolMessage>().await.unwrap().unwrap() {
                ToolMessage::CommandData {
                    channel: CommandChannel::Stdout,
                    body,
                    closed,
                } => {
                    stdout.extend(body);
                    if closed {
                        closed_channels += 1;
                    }
                }
                ToolMessage::CommandData { closed, .. } => {
                    if closed {
                        closed_channels += 1;
                    }
                }
                ToolMessage::CommandTermination { exit_code, .. } => break exit_code,
                ToolMessage::CommandRequest { .. } => panic!("unexpected request frame"),
            }
        };

        assert_eq!(stdout, b"hi\n");
        assert_eq!(closed_channels, 2);
        assert_eq!(exit_code, 0);
    }

    #[tokio::test]
    async fn test_no_agent_reports_failure_termination() {
        let registry = Arc::new(AgentRegistry::new());
        let (tool_io, server_io) = tokio::io::duplex(16 * 1024);
        tokio::spawn(handle_tool(server_io, "ghost".to_string(), registry));

        let mut tool = MessageStream::new(tool_io);
        tool.send(&ToolMessage::CommandRequest {
            name: "true".to_string(),
            arguments: Vec::new(),
            environment: Vec::new(),
        })
        .await
        .unwrap();

        match tool.recv::<ToolMessage>().await.unwrap().unwrap() {
            ToolMessage::CommandTermination { exit_code, message } => {
                assert_ne!(exit_code, 0);
                assert!(message.contains("ghost"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_disconnect_cancels_command() {
        let (registry, session, mut out_rx) = registry_with_agent();

        let (tool_io, server_io) = tokio::io::duplex(16 * 1024);
        tokio::spawn(handle_tool(server_io, "east".to_string(), registry));

        let mut tool = MessageStream::new(tool_io);
        tool.send(&ToolMessage::CommandRequest {
            name: "sleep".to_string(),
            arguments: vec!["60".to_string()],
            environment: Vec::new(),
        })
        .await
        .unwrap();

        // Agent receives the command, then the tool goes away.
        let frame = out_rx.recv().await.unwrap();
        let id = frame.request_id().unwrap().to_string();
        drop(tool);

        let cancel = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancel, AgentMessage::CancelRequest { id });
        assert_eq!(session.inflight_count(), 0);
    }
}
