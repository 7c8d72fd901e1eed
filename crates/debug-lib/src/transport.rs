//! Interactive stream transport
//!
//! Pumps local input to a remote process and its output back, forwarding
//! terminal resizes, until the process exits, the stream breaks or the
//! caller cancels. Every way out passes through the same teardown, which
//! restores the local terminal mode.

use crate::cluster::{
    BoxedReader, BoxedWriter, ClusterClient, ExitStatus, RemoteStreams, StreamOptions, TerminalSize, NO_EXIT_STATUS,
};
use crate::error::{DebugError, Result};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use futures::channel::mpsc;
use futures::SinkExt;
use std::io::IsTerminal;
use tokio::io::{self, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Local side of a session
pub struct IoStreams {
    pub input: BoxedReader,
    pub output: BoxedWriter,
    pub error: BoxedWriter,
    terminal: bool,
}

impl IoStreams {
    pub fn new(input: BoxedReader, output: BoxedWriter, error: BoxedWriter) -> Self {
        Self {
            input,
            output,
            error,
            terminal: false,
        }
    }

    /// The process's own stdin/stdout/stderr
    pub fn stdio() -> Self {
        Self {
            input: Box::new(tokio::io::stdin()),
            output: Box::new(tokio::io::stdout()),
            error: Box::new(tokio::io::stderr()),
            terminal: std::io::stdin().is_terminal(),
        }
    }

    /// Whether local input is a real terminal
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }
}

/// Session lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Attached,
    Closing(CloseReason),
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Remote process exited with code 0
    Normal,
    /// Remote process exited with a non-zero code
    RemoteError(i32),
    /// Stream setup or I/O failed
    TransportError(String),
    /// Caller cancelled
    Cancelled,
}

impl CloseReason {
    pub fn into_result(self) -> Result<()> {
        match self {
            CloseReason::Normal => Ok(()),
            CloseReason::RemoteError(code) => Err(DebugError::RemoteExit {
                code,
                stderr: String::new(),
            }),
            CloseReason::TransportError(message) => Err(DebugError::Transport(message)),
            CloseReason::Cancelled => Err(DebugError::Cancelled("session interrupted".to_string())),
        }
    }
}

/// Puts the local terminal in raw mode until dropped
pub struct RawModeGuard(bool);

impl RawModeGuard {
    pub fn new(enable: bool) -> Self {
        if enable {
            match enable_raw_mode() {
                Ok(()) => Self(true),
                Err(err) => {
                    warn!("Failed to enable raw terminal mode: {}", err);
                    Self(false)
                }
            }
        } else {
            Self(false)
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.0 {
            let _ = disable_raw_mode();
        }
    }
}

/// Attach local I/O to a container's main process and block until the session ends
pub async fn attach(
    cluster: &ClusterClient,
    pod: &str,
    container: &str,
    io: IoStreams,
    use_stdin: bool,
    use_tty: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut state = SessionState::Connecting;
    debug!(state = ?state, pod = %pod, container = %container, "Session state");

    let options = StreamOptions {
        stdin: use_stdin,
        tty: use_tty,
    };
    let streams = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return CloseReason::Cancelled.into_result();
        }
        streams = cluster.attach(pod, container, options) => streams?,
    };

    state = SessionState::Attached;
    debug!(state = ?state, "Session state");

    let reason = drive(streams, io, use_tty, cancel).await;

    state = SessionState::Closing(reason.clone());
    debug!(state = ?state, "Session state");
    reason.into_result()
}

/// Pump an open stream to completion
pub async fn drive(mut streams: RemoteStreams, io: IoStreams, use_tty: bool, cancel: &CancellationToken) -> CloseReason {
    let raw_terminal = use_tty && io.terminal;
    let _raw_mode = RawModeGuard::new(raw_terminal);

    let resize_task = match streams.resize.take() {
        Some(tx) if raw_terminal => Some(spawn_resize_forwarder(tx, terminal_size)),
        _ => None,
    };

    let reason = pump(streams, io, cancel).await;

    if let Some(task) = resize_task {
        task.abort();
    }
    reason
}

async fn pump(mut streams: RemoteStreams, io: IoStreams, cancel: &CancellationToken) -> CloseReason {
    let IoStreams {
        input,
        mut output,
        mut error,
        ..
    } = io;

    let stdin_task = streams
        .stdin
        .take()
        .map(|remote| tokio::spawn(forward_input(input, remote)));

    let stdout = streams.stdout.take();
    let stderr = streams.stderr.take();
    let status = streams.status;
    let finished = streams.finished;

    let session = async {
        let (out, err) = tokio::join!(copy_output(stdout, &mut output), copy_output(stderr, &mut error));
        let status = status.await;
        let finished = finished.await;

        if let Err(e) = out.and(err) {
            return CloseReason::TransportError(format!("stream I/O failed: {}", e));
        }
        if let Err(e) = finished {
            return CloseReason::TransportError(e.to_string());
        }
        match ExitStatus::from_status(status.as_ref()) {
            ExitStatus::Success => CloseReason::Normal,
            ExitStatus::Code(code) => CloseReason::RemoteError(code),
            ExitStatus::Failure(message) => CloseReason::TransportError(message),
            ExitStatus::Unknown => CloseReason::TransportError(NO_EXIT_STATUS.to_string()),
        }
    };

    let reason = tokio::select! {
        biased;
        _ = cancel.cancelled() => CloseReason::Cancelled,
        reason = session => reason,
    };

    if let Some(task) = stdin_task {
        task.abort();
    }
    reason
}

async fn forward_input(mut input: BoxedReader, mut remote: BoxedWriter) {
    if let Err(e) = io::copy(&mut input, &mut remote).await {
        debug!(error = %e, "Input forwarding stopped");
    }
    let _ = remote.shutdown().await;
}

async fn copy_output<W>(reader: Option<BoxedReader>, writer: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if let Some(mut reader) = reader {
        io::copy(&mut reader, writer).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Send the current size, then a new one on every window change
fn spawn_resize_forwarder<F>(mut tx: mpsc::Sender<TerminalSize>, current_size: F) -> JoinHandle<()>
where
    F: Fn() -> Option<TerminalSize> + Send + 'static,
{
    tokio::spawn(async move {
        if let Some(size) = current_size() {
            if tx.send(size).await.is_err() {
                return;
            }
        }

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let Ok(mut window_changes) = signal(SignalKind::window_change()) else {
                return;
            };
            while window_changes.recv().await.is_some() {
                if let Some(size) = current_size() {
                    debug!(width = size.width, height = size.height, "Terminal resized");
                    if tx.send(size).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn terminal_size() -> Option<TerminalSize> {
    crossterm::terminal::size()
        .ok()
        .map(|(width, height)| TerminalSize { width, height })
}
