//! Exec sessions: run a command in a container and bridge its stdio to
//! websocket streams.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;

use anyhow::Context as _;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::backend::Backend;
use crate::error::Cancelled;
use crate::operation::{Metadata, OperationContext};
use crate::session::{ControlMessage, SessionPipes, StdinChunk, StreamName};

const READ_CHUNK: usize = 8192;

/// Recorded output is cut off after this many bytes per stream.
const RECORD_LIMIT: usize = 64 * 1024;

/// Body of `POST /1.0/containers/{name}/exec`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case", default)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub environment: HashMap<String, String>,
    /// Hold the process until every stream has a socket attached.
    pub wait_for_websocket: bool,
    /// Merge stderr into stdout and skip the `2` stream.
    pub interactive: bool,
    /// Without websockets, keep the output in the operation metadata.
    pub record_output: bool,
}

impl ExecRequest {
    /// Streams to register secrets for.
    pub fn streams(&self) -> Vec<StreamName> {
        if self.interactive {
            vec![StreamName::Stdin, StreamName::Stdout, StreamName::Control]
        } else {
            StreamName::STDIO.to_vec()
        }
    }
}

/// Work function of an exec operation with attached websockets.
pub async fn run_attached(
    ctx: OperationContext,
    mut pipes: SessionPipes,
    backend: Arc<dyn Backend>,
    container: String,
    request: ExecRequest,
) -> anyhow::Result<Metadata> {
    if request.wait_for_websocket {
        debug!(operation = %ctx.id(), "Waiting for websockets");
        tokio::select! {
            connected = pipes.wait_connected() => {
                if !connected {
                    return Err(Cancelled.into());
                }
            }
            _ = ctx.cancelled() => return Err(Cancelled.into()),
        }
    }

    let mut child = backend
        .spawn_exec(&container, &request)
        .await
        .context("failed to start command")?;
    info!(operation = %ctx.id(), container = %container, pid = ?child.id(), "Exec process started");

    let mut pumps = Vec::new();
    let stdin_pump = match (child.stdin.take(), pipes.stdin.take()) {
        (Some(stdin), Some(rx)) => Some(tokio::spawn(pump_stdin(stdin, rx))),
        _ => None,
    };
    if let (Some(stdout), Some(tx)) = (child.stdout.take(), pipes.stdout.clone()) {
        pumps.push(tokio::spawn(pump_output(stdout, tx)));
    }
    let stderr_tx = if request.interactive {
        pipes.stdout.clone()
    } else {
        pipes.stderr.clone()
    };
    if let (Some(stderr), Some(tx)) = (child.stderr.take(), stderr_tx) {
        pumps.push(tokio::spawn(pump_output(stderr, tx)));
    }
    // The pumps own the only senders the process side needs
    pipes.stdout = None;
    pipes.stderr = None;

    let (_idle, idle_rx) = mpsc::channel(1);
    let mut control = pipes.control.take().unwrap_or(idle_rx);

    let status = supervise_child(&ctx, &mut child, &mut control).await?;

    for pump in pumps {
        let _ = pump.await;
    }
    if let Some(pump) = stdin_pump {
        pump.abort();
    }

    if ctx.is_cancelled() {
        return Err(Cancelled.into());
    }
    let code = exit_code(status);
    info!(operation = %ctx.id(), code, "Exec process exited");

    let mut metadata = Metadata::new();
    metadata.insert("return".into(), json!(code));
    Ok(metadata)
}

/// Work function of an exec operation without websockets.
pub async fn run_detached(
    ctx: OperationContext,
    backend: Arc<dyn Backend>,
    container: String,
    request: ExecRequest,
) -> anyhow::Result<Metadata> {
    let mut child = backend
        .spawn_exec(&container, &request)
        .await
        .context("failed to start command")?;
    drop(child.stdin.take());

    let stdout = child.stdout.take().map(|out| tokio::spawn(collect(out)));
    let stderr = child.stderr.take().map(|err| tokio::spawn(collect(err)));

    let (_idle, mut control) = mpsc::channel(1);
    let status = supervise_child(&ctx, &mut child, &mut control).await?;
    if ctx.is_cancelled() {
        return Err(Cancelled.into());
    }

    let mut metadata = Metadata::new();
    metadata.insert("return".into(), json!(exit_code(status)));
    if request.record_output {
        let stdout = joined_output(stdout).await;
        let stderr = joined_output(stderr).await;
        metadata.insert("output".into(), json!({ "1": stdout, "2": stderr }));
    }
    Ok(metadata)
}

/// Wait for the process, forwarding control messages and killing it on
/// cancellation.
async fn supervise_child(
    ctx: &OperationContext,
    child: &mut Child,
    control: &mut mpsc::Receiver<ControlMessage>,
) -> anyhow::Result<ExitStatus> {
    let token = ctx.token();
    let mut killed = false;
    loop {
        tokio::select! {
            status = child.wait() => return status.context("failed to wait for command"),
            _ = token.cancelled(), if !killed => {
                info!(operation = %ctx.id(), "Killing exec process");
                killed = true;
                if let Err(e) = child.start_kill() {
                    warn!(operation = %ctx.id(), error = %e, "Failed to kill exec process");
                }
            }
            Some(msg) = control.recv() => handle_control(ctx.id(), child.id(), msg),
        }
    }
}

fn handle_control(operation: &str, pid: Option<u32>, msg: ControlMessage) {
    match msg {
        ControlMessage::Signal { signal } => {
            let Some(pid) = pid else {
                return;
            };
            let result = Signal::try_from(signal)
                .map_err(|e| e.to_string())
                .and_then(|sig| kill(Pid::from_raw(pid as i32), sig).map_err(|e| e.to_string()));
            match result {
                Ok(()) => debug!(operation = %operation, signal, "Forwarded signal"),
                Err(e) => warn!(operation = %operation, signal, error = %e, "Failed to forward signal"),
            }
        }
        ControlMessage::WindowResize { args } => match args.dimensions() {
            // No pty is allocated for host processes, so there is nothing to resize
            Some((width, height)) => debug!(operation = %operation, width, height, "Window resize"),
            None => warn!(operation = %operation, ?args, "Ignoring malformed window size"),
        },
    }
}

async fn pump_stdin(mut stdin: ChildStdin, mut rx: mpsc::Receiver<StdinChunk>) {
    while let Some(chunk) = rx.recv().await {
        match chunk {
            StdinChunk::Data(data) => {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
            StdinChunk::Eof => break,
        }
    }
    // Dropping the handle closes the pipe
}

async fn pump_output<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn collect<R>(mut reader: R) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = RECORD_LIMIT.saturating_sub(out.len());
                out.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    out
}

async fn joined_output(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    match handle {
        Some(handle) => String::from_utf8_lossy(&handle.await.unwrap_or_default()).into_owned(),
        None => String::new(),
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}
