//! Agent-side command execution
//!
//! Runs a forwarded command with piped stdout/stderr, streaming output
//! frames as bytes arrive. Both channels report EOF before the termination
//! frame is sent. Agents often run as root to manage sockets; children are
//! always dropped to an unprivileged uid/gid.

use burrow_proto::{AgentMessage, CommandChannel};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::cancel::CancelTable;

/// uid/gid children run under when the agent itself is root (nobody).
const UNPRIVILEGED_ID: u32 = 65534;

const READ_BUFFER: usize = 10240;

enum OutputEvent {
    Data(CommandChannel, Vec<u8>),
    Closed(CommandChannel),
}

fn spawn_output_reader<R>(
    channel: CommandChannel,
    mut reader: R,
    events: mpsc::Sender<OutputEvent>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = [0u8; READ_BUFFER];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => {
                    let _ = events.send(OutputEvent::Closed(channel)).await;
                    return;
                }
                Ok(n) => {
                    // The buffer is reused; the frame owns its own copy.
                    let data = buffer[..n].to_vec();
                    if events.send(OutputEvent::Data(channel, data)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(channel = ?channel, error = %e, "Pipe read ended");
                    let _ = events.send(OutputEvent::Closed(channel)).await;
                    return;
                }
            }
        }
    });
}

async fn send_failed(
    out: &mpsc::Sender<AgentMessage>,
    id: &str,
    context: &str,
    error: impl std::fmt::Display,
) {
    let _ = out
        .send(AgentMessage::CommandTermination {
            id: id.to_string(),
            exit_code: 127,
            message: format!("{context}: {error}"),
        })
        .await;
}

#[cfg(unix)]
fn downgrade_privileges(cmd: &mut Command) {
    if nix::unistd::geteuid().is_root() {
        cmd.uid(UNPRIVILEGED_ID).gid(UNPRIVILEGED_ID);
    }
}

#[cfg(not(unix))]
fn downgrade_privileges(_cmd: &mut Command) {}

/// Execute one forwarded command request.
pub async fn run_command(
    out: mpsc::Sender<AgentMessage>,
    cancels: CancelTable,
    id: String,
    name: String,
    arguments: Vec<String>,
    environment: Vec<String>,
) {
    let registration = cancels.register(&id);
    let token = registration.token();

    tracing::info!(request_id = %id, command = %name, "Executing remote command");

    let mut cmd = Command::new(&name);
    cmd.args(&arguments)
        .env_clear()
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    for entry in &environment {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
    downgrade_privileges(&mut cmd);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            send_failed(&out, &id, "spawn", e).await;
            return;
        }
    };

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        send_failed(&out, &id, "pipes", "stdout/stderr not captured").await;
        return;
    };

    let (events_tx, mut events_rx) = mpsc::channel(16);
    spawn_output_reader(CommandChannel::Stdout, stdout, events_tx.clone());
    spawn_output_reader(CommandChannel::Stderr, stderr, events_tx);

    let mut open_channels = 2;
    let mut killed = false;
    while open_channels > 0 {
        tokio::select! {
            _ = token.cancelled(), if !killed => {
                tracing::info!(request_id = %id, "Cancel received, killing child");
                killed = true;
                let _ = child.start_kill();
            }
            event = events_rx.recv() => match event {
                Some(OutputEvent::Data(channel, data)) => {
                    let frame = AgentMessage::CommandData {
                        id: id.clone(),
                        channel,
                        body: data,
                        closed: false,
                    };
                    if out.send(frame).await.is_err() {
                        return;
                    }
                }
                Some(OutputEvent::Closed(channel)) => {
                    open_channels -= 1;
                    let frame = AgentMessage::CommandData {
                        id: id.clone(),
                        channel,
                        body: Vec::new(),
                        closed: true,
                    };
                    if out.send(frame).await.is_err() {
                        return;
                    }
                }
                None => break,
            }
        }
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            send_failed(&out, &id, "wait", e).await;
            return;
        }
    };

    tracing::info!(request_id = %id, exit_code, "Remote command finished");
    let _ = out
        .send(AgentMessage::CommandTermination {
            id,
            exit_code,
            message: String::new(),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn collect_frames(rx: &mut mpsc::Receiver<AgentMessage>) -> Vec<AgentMessage> {
        let mut frames = Vec::new();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for command frames")
                .expect("channel closed before termination");
            let done = matches!(frame, AgentMessage::CommandTermination { .. });
            frames.push(frame);
            if done {
                break;
            }
        }
        frames
    }

    fn stdout_of(frames: &[AgentMessage]) -> Vec<u8> {
        frames
            .iter()
            .filter_map(|f| match f {
                AgentMessage::CommandData {
                    channel: CommandChannel::Stdout,
                    body,
                    closed: false,
                    ..
                } => Some(body.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[tokio::test]
    async fn test_echo_streams_and_terminates_cleanly() {
        let (tx, mut rx) = mpsc::channel(32);
        run_command(
            tx,
            CancelTable::new(),
            "req-1".to_string(),
            "/bin/echo".to_string(),
            vec!["hi".to_string()],
            Vec::new(),
        )
        .await;

        let frames = collect_frames(&mut rx).await;
        assert_eq!(stdout_of(&frames), b"hi\n");

        // Exactly one closed frame per channel, all before termination.
        let closed: Vec<_> = frames
            .iter()
            .filter_map(|f| match f {
                AgentMessage::CommandData {
                    channel,
                    closed: true,
                    ..
                } => Some(*channel),
                _ => None,
            })
            .collect();
        assert_eq!(closed.len(), 2);
        assert!(closed.contains(&CommandChannel::Stdout));
        assert!(closed.contains(&CommandChannel::Stderr));

        match frames.last().unwrap() {
            AgentMessage::CommandTermination {
                exit_code, message, ..
            } => {
                assert_eq!(*exit_code, 0);
                assert!(message.is_empty());
            }
            other => panic!("unexpected final frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exit_code_propagates() {
        let (tx, mut rx) = mpsc::channel(32);
        run_command(
            tx,
            CancelTable::new(),
            "req-2".to_string(),
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "exit 3".to_string()],
            Vec::new(),
        )
        .await;

        let frames = collect_frames(&mut rx).await;
        assert!(matches!(
            frames.last().unwrap(),
            AgentMessage::CommandTermination { exit_code: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_environment_replaces_wholesale() {
        let (tx, mut rx) = mpsc::channel(32);
        run_command(
            tx,
            CancelTable::new(),
            "req-3".to_string(),
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "echo \"$GREETING:$HOME\"".to_string()],
            vec!["GREETING=hello".to_string()],
        )
        .await;

        let frames = collect_frames(&mut rx).await;
        // HOME is not inherited; only the provided environment exists.
        assert_eq!(stdout_of(&frames), b"hello:\n");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_exit_127() {
        let (tx, mut rx) = mpsc::channel(32);
        run_command(
            tx,
            CancelTable::new(),
            "req-4".to_string(),
            "definitely-not-a-command-xyz".to_string(),
            Vec::new(),
            Vec::new(),
        )
        .await;

        match rx.recv().await.unwrap() {
            AgentMessage::CommandTermination {
                exit_code, message, ..
            } => {
                assert_eq!(exit_code, 127);
                assert!(message.contains("spawn"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stderr_goes_to_stderr_channel() {
        let (tx, mut rx) = mpsc::channel(32);
        run_command(
            tx,
            CancelTable::new(),
            "req-5".to_string(),
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "echo oops >&2".to_string()],
            Vec::new(),
        )
        .await;

        let frames = collect_frames(&mut rx).await;
        let stderr: Vec<u8> = frames
            .iter()
            .filter_map(|f| match f {
                AgentMessage::CommandData {
                    channel: CommandChannel::Stderr,
                    body,
                    closed: false,
                    ..
                } => Some(body.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(stderr, b"oops\n");
        assert!(stdout_of(&frames).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_kills_long_running_child() {
        let (tx, mut rx) = mpsc::channel(32);
        let cancels = CancelTable::new();
        let cancels_clone = cancels.clone();

        let runner = tokio::spawn(run_command(
            tx,
            cancels_clone,
            "req-6".to_string(),
            "/bin/sleep".to_string(),
            vec!["30".to_string()],
            Vec::new(),
        ));

        // Give the child a moment to start, then cancel.
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancels.cancel("req-6");

        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("cancel did not stop the command")
            .unwrap();

        // Channels still close before the termination frame.
        let frames = collect_frames(&mut rx).await;
        let termination_index = frames
            .iter()
            .position(|f| matches!(f, AgentMessage::CommandTermination { .. }))
            .unwrap();
        let closed_count = frames[..termination_index]
            .iter()
            .filter(|f| matches!(f, AgentMessage::CommandData { closed: true, .. }))
            .count();
        assert_eq!(closed_count, 2);
    }
}
