//! Bidirectional channel to a worker process.
//!
//! The worker reads JSON lines on stdin and writes JSON lines on stdout;
//! its stderr is forwarded to the gateway log. A supervisor task owns the
//! child and turns its exit into the end of the [`SubprocessEvents`]
//! stream:
//!
//! | How the process ended        | Last stream item                  |
//! |------------------------------|-----------------------------------|
//! | exit code 0                  | none (stream just ends)           |
//! | [`UNREGISTERED_EXIT_CODE`]   | `Err(SubprocessError::Unregistered)` |
//! | any other code               | `Err(SubprocessError::Failed)`    |
//! | killed by a signal           | `Err(SubprocessError::Crashed)`   |
//! | [`SubprocessChannel::destroy`] | none (stream just ends)         |

use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, trace, warn};

use super::message::SubprocessMessage;
use crate::config::WorkerSpec;
use crate::error::SubprocessError;

/// Exit code a worker uses to say the gateway is not registered
pub const UNREGISTERED_EXIT_CODE: i32 = 2;

/// Longest accepted line on stdout/stderr
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// How long to keep reading stdout after the process exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Buffered messages between the stdout reader and the consumer
const EVENT_BUFFER: usize = 64;

/// Item type of [`SubprocessEvents`]
pub type SubprocessEvent = Result<SubprocessMessage, SubprocessError>;

/// Handle used to write to and terminate a worker process
pub struct SubprocessChannel {
    name: String,
    pid: u32,
    stdin: tokio::sync::Mutex<FramedWrite<ChildStdin, LinesCodec>>,
    kill_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

/// Messages read from a worker, ending when the worker terminates
pub struct SubprocessEvents {
    rx: mpsc::Receiver<SubprocessEvent>,
}

impl Stream for SubprocessEvents {
    type Item = SubprocessEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl SubprocessChannel {
    /// Launch a worker process.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(spec: &WorkerSpec) -> Result<(Self, SubprocessEvents), SubprocessError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SubprocessError::SpawnFailed(format!("{}: {}", spec.command, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| SubprocessError::SpawnFailed("failed to get process ID".to_string()))?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => return Err(SubprocessError::SpawnFailed("stdio pipes unavailable".to_string())),
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(forward_stderr(stderr, spec.name.clone(), pid));
        let reader = tokio::spawn(read_stdout(stdout, tx.clone(), spec.name.clone(), pid));
        tokio::spawn(supervise(child, reader, kill_rx, tx, spec.name.clone(), pid));

        info!(worker = %spec.name, pid, "Worker started");

        let channel = Self {
            name: spec.name.clone(),
            pid,
            stdin: tokio::sync::Mutex::new(FramedWrite::new(
                stdin,
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            )),
            kill_tx: parking_lot::Mutex::new(Some(kill_tx)),
        };
        Ok((channel, SubprocessEvents { rx }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Send one message to the worker as a JSON line
    pub async fn write<M: Serialize>(&self, message: &M) -> Result<(), SubprocessError> {
        let line = serde_json::to_string(message)
            .map_err(|e| SubprocessError::Serialization(e.to_string()))?;
        let mut stdin = self.stdin.lock().await;
        stdin
            .send(line)
            .await
            .map_err(|_| SubprocessError::ChannelClosed)
    }

    /// Kill the worker. Its event stream ends without an error.
    ///
    /// Calling this more than once is harmless.
    pub fn destroy(&self) {
        if let Some(kill_tx) = self.kill_tx.lock().take() {
            let _ = kill_tx.send(());
        }
    }
}

impl Drop for SubprocessChannel {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Map an exit status to the error it represents, if any
fn classify_exit(status: ExitStatus) -> Option<SubprocessError> {
    match status.code() {
        Some(0) => None,
        Some(UNREGISTERED_EXIT_CODE) => Some(SubprocessError::Unregistered),
        Some(code) => Some(SubprocessError::Failed { code }),
        None => Some(SubprocessError::Crashed {
            signal: exit_signal(&status),
        }),
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

async fn supervise(
    mut child: Child,
    mut reader: JoinHandle<()>,
    kill_rx: oneshot::Receiver<()>,
    tx: mpsc::Sender<SubprocessEvent>,
    name: String,
    pid: u32,
) {
    tokio::select! {
        status = child.wait() => {
            // Let the reader deliver what the worker wrote before exiting
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut reader).await.is_err() {
                reader.abort();
            }

            let failure = match status {
                Ok(status) => {
                    info!(worker = %name, pid, %status, "Worker exited");
                    classify_exit(status)
                }
                Err(e) => {
                    warn!(worker = %name, pid, error = %e, "Failed to wait for worker");
                    Some(SubprocessError::Crashed { signal: None })
                }
            };
            if let Some(failure) = failure {
                let _ = tx.send(Err(failure)).await;
            }
        }
        _ = kill_rx => {
            // Requested or the handle was dropped
            reader.abort();
            if let Err(e) = child.kill().await {
                debug!(worker = %name, pid, error = %e, "Worker already gone");
            }
            info!(worker = %name, pid, "Worker destroyed");
        }
    }
}

async fn read_stdout(
    stdout: ChildStdout,
    tx: mpsc::Sender<SubprocessEvent>,
    name: String,
    pid: u32,
) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => match SubprocessMessage::parse_line(&line) {
                Some(message) => {
                    if tx.send(Ok(message)).await.is_err() {
                        trace!(worker = %name, pid, "Event stream dropped; discarding output");
                    }
                }
                None => trace!(worker = %name, pid, line = %line, "Ignoring unrecognised worker output"),
            },
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(worker = %name, pid, "Worker wrote an over-long line; skipped");
            }
            Err(LinesCodecError::Io(e)) => {
                warn!(worker = %name, pid, error = %e, "Failed to read worker stdout");
                break;
            }
        }
    }
}

async fn forward_stderr(stderr: ChildStderr, name: String, pid: u32) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => info!(worker = %name, pid, "{}", line),
            Err(LinesCodecError::MaxLineLengthExceeded) => continue,
            Err(LinesCodecError::Io(_)) => break,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::status::ConnectivityStatus;

    async fn drain(mut events: SubprocessEvents) -> Vec<SubprocessEvent> {
        let mut items = Vec::new();
        let collect = async {
            while let Some(item) = events.next().await {
                items.push(item);
            }
        };
        tokio::time::timeout(Duration::from_secs(10), collect)
            .await
            .expect("worker stream did not end");
        items
    }

    #[tokio::test]
    async fn test_messages_then_clean_close() {
        let spec = WorkerSpec::shell(
            "test",
            r#"echo '{"type":"stage","stage":"a"}'; echo garbage; echo '{"type":"status","status":"connected"}'"#,
        );
        let (_channel, events) = SubprocessChannel::spawn(&spec).unwrap();

        let items = drain(events).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(
            &items[0],
            Ok(SubprocessMessage::Stage { stage }) if stage == "a"
        ));
        assert!(matches!(
            &items[1],
            Ok(SubprocessMessage::Status { status: ConnectivityStatus::Connected })
        ));
    }

    #[tokio::test]
    async fn test_unregistered_exit_code() {
        let (_channel, events) =
            SubprocessChannel::spawn(&WorkerSpec::shell("test", "exit 2")).unwrap();
        let items = drain(events).await;
        assert!(matches!(items.last(), Some(Err(SubprocessError::Unregistered))));
    }

    #[tokio::test]
    async fn test_failed_exit_code() {
        let (_channel, events) =
            SubprocessChannel::spawn(&WorkerSpec::shell("test", "exit 7")).unwrap();
        let items = drain(events).await;
        assert!(matches!(
            items.last(),
            Some(Err(SubprocessError::Failed { code: 7 }))
        ));
    }

    #[tokio::test]
    async fn test_crash_by_signal() {
        let (_channel, events) =
            SubprocessChannel::spawn(&WorkerSpec::shell("test", "kill -9 $$")).unwrap();
        let items = drain(events).await;
        assert!(matches!(
            items.last(),
            Some(Err(SubprocessError::Crashed { signal: Some(9) }))
        ));
    }

    #[tokio::test]
    async fn test_destroy_closes_without_error() {
        let (channel, events) =
            SubprocessChannel::spawn(&WorkerSpec::shell("test", "exec sleep 30")).unwrap();
        channel.destroy();
        channel.destroy();

        let items = drain(events).await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_write_reaches_worker() {
        let (channel, mut events) =
            SubprocessChannel::spawn(&WorkerSpec::shell("test", "read line; echo \"$line\""))
                .unwrap();

        let message = SubprocessMessage::Stage {
            stage: "echo".to_string(),
        };
        channel.write(&message).await.unwrap();

        let echoed = tokio::time::timeout(Duration::from_secs(10), events.next())
            .await
            .unwrap();
        assert_eq!(echoed.unwrap().unwrap(), message);
    }

    #[tokio::test]
    async fn test_spawn_invalid_command() {
        let spec = WorkerSpec::new("test", "nonexistent_command_12345");
        assert!(matches!(
            SubprocessChannel::spawn(&spec),
            Err(SubprocessError::SpawnFailed(_))
        ));
    }
}
