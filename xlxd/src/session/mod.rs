//! Secret-gated interactive streams for exec and console operations.
//!
//! When an interactive operation is created the bridge mints one secret per
//! stream. A client trades a secret for exactly one websocket, which is then
//! spliced onto the matching process pipe. Secrets and open sockets die with
//! the operation.

mod socket;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{OperationError, Result};
use crate::operation::Registry;

pub use socket::splice;

/// Buffered chunks per stream before the producer waits.
const PIPE_DEPTH: usize = 64;

/// Named interactive stream of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamName {
    Stdin,
    Stdout,
    Stderr,
    Control,
}

impl StreamName {
    pub const STDIO: [StreamName; 4] = [
        StreamName::Stdin,
        StreamName::Stdout,
        StreamName::Stderr,
        StreamName::Control,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamName::Stdin => "0",
            StreamName::Stdout => "1",
            StreamName::Stderr => "2",
            StreamName::Control => "control",
        }
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "0" => Ok(StreamName::Stdin),
            "1" => Ok(StreamName::Stdout),
            "2" => Ok(StreamName::Stderr),
            "control" => Ok(StreamName::Control),
            other => Err(format!("unknown stream: {}", other)),
        }
    }
}

/// Data travelling from a client socket to the process stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinChunk {
    Data(Vec<u8>),
    /// The client closed its socket.
    Eof,
}

/// Terminal dimensions as sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub width: String,
    pub height: String,
}

impl WindowSize {
    pub fn dimensions(&self) -> Option<(u16, u16)> {
        Some((self.width.parse().ok()?, self.height.parse().ok()?))
    }
}

/// Out-of-band message on the `control` stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlMessage {
    WindowResize { args: WindowSize },
    Signal { signal: i32 },
}

/// Socket-side end of a stream, handed out on upgrade.
pub enum SocketEnd {
    Input(mpsc::Sender<StdinChunk>),
    Output(mpsc::Receiver<Vec<u8>>),
    Control(mpsc::Sender<ControlMessage>),
}

/// A consumed secret: one socket bound to one stream of one operation.
pub struct BoundStream {
    pub operation: String,
    pub stream: StreamName,
    pub end: SocketEnd,
    closed: CancellationToken,
}

impl BoundStream {
    /// Fires when the operation ends and the socket must close.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }
}

/// Process-side ends of the registered streams.
pub struct SessionPipes {
    pub stdin: Option<mpsc::Receiver<StdinChunk>>,
    pub stdout: Option<mpsc::Sender<Vec<u8>>>,
    pub stderr: Option<mpsc::Sender<Vec<u8>>>,
    pub control: Option<mpsc::Receiver<ControlMessage>>,
    connected: watch::Receiver<usize>,
    expected: usize,
    closed: CancellationToken,
}

impl SessionPipes {
    /// Wait until every registered stream has a socket attached.
    ///
    /// Returns `false` if the session was torn down first.
    pub async fn wait_connected(&mut self) -> bool {
        let expected = self.expected;
        tokio::select! {
            res = self.connected.wait_for(|n| *n >= expected) => res.is_ok(),
            _ = self.closed.cancelled() => false,
        }
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }
}

struct Secret {
    value: String,
    consumed: AtomicBool,
}

struct Slot {
    secret: Secret,
    end: Mutex<Option<SocketEnd>>,
}

struct Session {
    slots: HashMap<StreamName, Slot>,
    connected: watch::Sender<usize>,
    closed: CancellationToken,
}

/// Binds secrets to operation streams and validates upgrades.
#[derive(Clone)]
pub struct SessionBridge {
    registry: Arc<Registry>,
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionBridge {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Mint one secret per stream for `operation`.
    ///
    /// Returns the stream-name-to-secret mapping for the client and the
    /// process-side pipes for the work function.
    pub fn register(
        &self,
        operation: &str,
        streams: &[StreamName],
    ) -> (BTreeMap<String, String>, SessionPipes) {
        let (connected, connected_rx) = watch::channel(0usize);
        let closed = CancellationToken::new();
        let mut slots = HashMap::new();
        let mut secrets = BTreeMap::new();
        let mut pipes = SessionPipes {
            stdin: None,
            stdout: None,
            stderr: None,
            control: None,
            connected: connected_rx,
            expected: 0,
            closed: closed.clone(),
        };

        for &stream in streams {
            if slots.contains_key(&stream) {
                continue;
            }
            let end = match stream {
                StreamName::Stdin => {
                    let (tx, rx) = mpsc::channel(PIPE_DEPTH);
                    pipes.stdin = Some(rx);
                    SocketEnd::Input(tx)
                }
                StreamName::Stdout | StreamName::Stderr => {
                    let (tx, rx) = mpsc::channel(PIPE_DEPTH);
                    if stream == StreamName::Stdout {
                        pipes.stdout = Some(tx);
                    } else {
                        pipes.stderr = Some(tx);
                    }
                    SocketEnd::Output(rx)
                }
                StreamName::Control => {
                    let (tx, rx) = mpsc::channel(PIPE_DEPTH);
                    pipes.control = Some(rx);
                    SocketEnd::Control(tx)
                }
            };
            let value = new_secret();
            secrets.insert(stream.as_str().to_string(), value.clone());
            slots.insert(
                stream,
                Slot {
                    secret: Secret {
                        value,
                        consumed: AtomicBool::new(false),
                    },
                    end: Mutex::new(Some(end)),
                },
            );
        }
        pipes.expected = slots.len();

        self.sessions.write().insert(
            operation.to_string(),
            Arc::new(Session {
                slots,
                connected,
                closed,
            }),
        );
        debug!(operation = %operation, streams = secrets.len(), "Registered websocket secrets");

        (secrets, pipes)
    }

    /// Trade a secret for the socket end of its stream.
    pub fn upgrade(&self, operation: &str, secret: &str) -> Result<BoundStream> {
        let status = self
            .registry
            .get(operation)
            .map_err(|_| OperationError::InvalidSecret)?
            .status;
        if status.is_terminal() {
            return Err(OperationError::OperationNotRunning(operation.to_string()));
        }

        let Some(session) = self.sessions.read().get(operation).cloned() else {
            return Err(self.rejection(operation));
        };

        let (stream, slot) = session
            .slots
            .iter()
            .find(|(_, slot)| slot.secret.value == secret)
            .ok_or(OperationError::InvalidSecret)?;

        slot.secret
            .consumed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| OperationError::InvalidSecret)?;

        let end = slot.end.lock().take().ok_or(OperationError::InvalidSecret)?;
        // The record turns terminal before its session is released.
        if session.closed.is_cancelled() || self.is_finished(operation) {
            return Err(OperationError::OperationNotRunning(operation.to_string()));
        }
        session.connected.send_modify(|n| *n += 1);
        info!(operation = %operation, stream = %stream, "Websocket connected");

        Ok(BoundStream {
            operation: operation.to_string(),
            stream: *stream,
            end,
            closed: session.closed.clone(),
        })
    }

    /// Error for an upgrade whose session is already gone.
    fn rejection(&self, operation: &str) -> OperationError {
        if self.is_finished(operation) {
            OperationError::OperationNotRunning(operation.to_string())
        } else {
            OperationError::InvalidSecret
        }
    }

    fn is_finished(&self, operation: &str) -> bool {
        self.registry
            .get(operation)
            .map(|op| op.status.is_terminal())
            .unwrap_or(false)
    }

    /// Drop all secrets of an operation and close its open sockets.
    pub fn release(&self, operation: &str) {
        let Some(session) = self.sessions.write().remove(operation) else {
            return;
        };
        session.closed.cancel();
        let unused = session
            .slots
            .values()
            .filter(|slot| !slot.secret.consumed.load(Ordering::Acquire))
            .count();
        debug!(operation = %operation, unused_secrets = unused, "Released websocket session");
    }

    pub fn is_registered(&self, operation: &str) -> bool {
        self.sessions.read().contains_key(operation)
    }
}

fn new_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::operation::{Engine, EngineConfig, Metadata, OperationClass, OperationSpec};
    use std::time::Duration;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default(), EventBus::new(16))
    }

    async fn running_operation(engine: &Engine) -> String {
        let op = engine
            .create(
                OperationSpec::new(OperationClass::Websocket, "Executing command"),
                |ctx| async move {
                    ctx.cancelled().await;
                    Ok(Metadata::new())
                },
            )
            .unwrap();
        op.id
    }

    #[tokio::test]
    async fn secret_is_single_use() {
        let engine = engine();
        let id = running_operation(&engine).await;
        let bridge = engine.sessions();
        let (secrets, _pipes) = bridge.register(
            &id,
            &[StreamName::Stdin, StreamName::Stdout, StreamName::Stderr],
        );
        assert_eq!(secrets.len(), 3);

        let wrong = bridge.upgrade(&id, "not-a-secret");
        assert!(matches!(wrong, Err(OperationError::InvalidSecret)));

        let bound = bridge.upgrade(&id, &secrets["1"]).unwrap();
        assert_eq!(bound.stream, StreamName::Stdout);
        assert!(matches!(bound.end, SocketEnd::Output(_)));

        let replay = bridge.upgrade(&id, &secrets["1"]);
        assert!(matches!(replay, Err(OperationError::InvalidSecret)));

        // Other streams are unaffected
        assert!(bridge.upgrade(&id, &secrets["0"]).is_ok());
    }

    #[tokio::test]
    async fn terminal_operation_rejects_upgrade() {
        let engine = engine();
        let op = engine
            .create_interactive(
                OperationSpec::new(OperationClass::Websocket, "Executing command"),
                &[StreamName::Stdout],
                |_ctx, _pipes| async { Ok(Metadata::new()) },
            )
            .unwrap();
        let secret = op.metadata["fds"]["1"].as_str().unwrap().to_string();

        engine.wait(&op.id, Some(Duration::from_secs(5))).await.unwrap();
        let res = engine.sessions().upgrade(&op.id, &secret);
        assert!(matches!(res, Err(OperationError::OperationNotRunning(_))));
        assert!(!engine.sessions().is_registered(&op.id));
    }

    #[tokio::test]
    async fn closing_session_rejects_upgrade() {
        let engine = engine();
        let id = running_operation(&engine).await;
        let bridge = engine.sessions();
        let (secrets, _pipes) = bridge.register(&id, &[StreamName::Stdout]);

        // Teardown has started but the session is still listed
        let session = bridge.sessions.read().get(&id).cloned().unwrap();
        session.closed.cancel();

        let res = bridge.upgrade(&id, &secrets["1"]);
        assert!(matches!(res, Err(OperationError::OperationNotRunning(_))));
        assert_eq!(*session.connected.borrow(), 0);
    }

    #[tokio::test]
    async fn released_session_of_finished_operation_is_not_running() {
        let engine = engine();
        let op = engine
            .create(
                OperationSpec::new(OperationClass::Websocket, "Executing command"),
                |_ctx| async { Ok(Metadata::new()) },
            )
            .unwrap();
        let (secrets, _pipes) = engine.sessions().register(&op.id, &[StreamName::Stdout]);
        engine.wait(&op.id, Some(Duration::from_secs(5))).await.unwrap();

        assert!(matches!(
            engine.sessions().rejection(&op.id),
            OperationError::OperationNotRunning(_)
        ));
        assert!(matches!(
            engine.sessions().upgrade(&op.id, &secrets["1"]),
            Err(OperationError::OperationNotRunning(_))
        ));
    }

    #[tokio::test]
    async fn wait_connected_tracks_every_stream() {
        let engine = engine();
        let id = running_operation(&engine).await;
        let bridge = engine.sessions();
        let (secrets, mut pipes) = bridge.register(&id, &[StreamName::Stdin, StreamName::Control]);

        bridge.upgrade(&id, &secrets["0"]).unwrap();
        let early = tokio::time::timeout(Duration::from_millis(50), pipes.wait_connected()).await;
        assert!(early.is_err());

        bridge.upgrade(&id, &secrets["control"]).unwrap();
        assert!(pipes.wait_connected().await);
    }

    #[tokio::test]
    async fn release_closes_bound_streams() {
        let engine = engine();
        let id = running_operation(&engine).await;
        let bridge = engine.sessions();
        let (secrets, mut pipes) = bridge.register(&id, &[StreamName::Stdin, StreamName::Stdout]);

        let bound = bridge.upgrade(&id, &secrets["0"]).unwrap();
        bridge.release(&id);

        assert!(bound.closed().is_cancelled());
        assert!(pipes.closed().is_cancelled());
        assert!(!pipes.wait_connected().await);
        assert!(matches!(
            bridge.upgrade(&id, &secrets["1"]),
            Err(OperationError::InvalidSecret)
        ));
    }

    #[test]
    fn control_messages_parse() {
        let resize: ControlMessage = serde_json::from_str(
            r#"{"command":"window-resize","args":{"width":"80","height":"24"}}"#,
        )
        .unwrap();
        match resize {
            ControlMessage::WindowResize { args } => assert_eq!(args.dimensions(), Some((80, 24))),
            other => panic!("unexpected {:?}", other),
        }

        let signal: ControlMessage =
            serde_json::from_str(r#"{"command":"signal","signal":15}"#).unwrap();
        assert_eq!(signal, ControlMessage::Signal { signal: 15 });
        assert_eq!("control".parse::<StreamName>().unwrap(), StreamName::Control);
    }
}
