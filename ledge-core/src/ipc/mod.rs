//! IPC server - the Unix-socket control surface
//!
//! External tools talk to a running host over a socket in the runtime
//! directory, one JSON message per line. Commands get correlated
//! replies; bus events are broadcast to every connected client; a
//! malformed line is answered with an error on the offending
//! connection only. The single fatal failure in this module is the
//! initial bind.

pub mod wire;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::error::IpcError;
use wire::{Request, Response};

/// Host-side handler for one named command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<Value, String>;
}

/// Named command dispatch table.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Re-registering a name replaces the previous
    /// handler.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let name = name.into();
        let previous = self
            .handlers
            .write()
            .unwrap()
            .insert(name.clone(), handler);
        if previous.is_some() {
            warn!(command = %name, "command handler replaced");
        }
    }

    pub async fn dispatch(&self, name: &str, payload: Value) -> Result<Value, String> {
        let handler = self.handlers.read().unwrap().get(name).cloned();
        match handler {
            Some(handler) => handler.handle(payload).await,
            None => Err(format!("Unknown command: {name}")),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Handle onto a running IPC server.
pub struct IpcServerHandle {
    token: CancellationToken,
    socket_path: PathBuf,
}

impl IpcServerHandle {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop accepting, disconnect clients, and remove the socket file.
    pub fn stop(&self) {
        self.token.cancel();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

const BROADCAST_CAPACITY: usize = 64;

/// Bind the socket and start serving.
///
/// A stale socket file from a previous run is removed before binding;
/// failing the bind itself is fatal and surfaced to the caller.
pub fn serve(
    socket_path: PathBuf,
    commands: Arc<CommandRegistry>,
    bus: Arc<EventBus>,
) -> Result<IpcServerHandle, IpcError> {
    if socket_path.exists() {
        debug!(path = %socket_path.display(), "removing stale socket");
        std::fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    info!(path = %socket_path.display(), "IPC server listening");

    let (broadcast_tx, _) = broadcast::channel::<Response>(BROADCAST_CAPACITY);
    {
        let broadcast_tx = broadcast_tx.clone();
        bus.tap(Arc::new(move |topic, payload| {
            let _ = broadcast_tx.send(Response::Broadcast {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
        }));
    }

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(accept_loop(listener, commands, bus, broadcast_tx, token));
    }

    Ok(IpcServerHandle { token, socket_path })
}

async fn accept_loop(
    listener: UnixListener,
    commands: Arc<CommandRegistry>,
    bus: Arc<EventBus>,
    broadcast_tx: broadcast::Sender<Response>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    debug!("IPC client connected");
                    tokio::spawn(serve_client(
                        stream,
                        commands.clone(),
                        bus.clone(),
                        broadcast_tx.subscribe(),
                        token.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "IPC accept failed");
                }
            },
        }
    }
    debug!("IPC accept loop stopped");
}

async fn serve_client(
    stream: UnixStream,
    commands: Arc<CommandRegistry>,
    bus: Arc<EventBus>,
    mut broadcasts: broadcast::Receiver<Response>,
    token: CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,

            broadcast = broadcasts.recv() => match broadcast {
                Ok(response) => {
                    if write_line(&mut write_half, &response).await.is_err() {
                        break;
                    }
                }
                // Slow client fell behind the broadcast buffer; skip
                // the dropped events and keep going.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "IPC client lagged behind broadcasts");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Some(response) =
                        handle_line(&line, &commands, &bus).await
                    {
                        if write_line(&mut write_half, &response).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "IPC client read failed");
                    break;
                }
            },
        }
    }
    debug!("IPC client disconnected");
}

/// Handle one request line; `None` means no response is owed.
async fn handle_line(
    line: &str,
    commands: &CommandRegistry,
    bus: &EventBus,
) -> Option<Response> {
    match serde_json::from_str::<Request>(line) {
        Ok(Request::Command { name, id, payload }) => {
            debug!(command = %name, request = %id, "dispatching command");
            match commands.dispatch(&name, payload).await {
                Ok(result) => Some(Response::reply(id, result)),
                Err(message) => Some(Response::error(Some(id), message)),
            }
        }
        Ok(Request::Publish { topic, payload, id }) => {
            let delivered = bus.publish(&topic, &payload);
            debug!(%topic, delivered, "client publish");
            id.map(|id| Response::reply(id, serde_json::json!({ "delivered": delivered })))
        }
        Err(e) => Some(Response::error(None, format!("malformed message: {e}"))),
    }
}

async fn write_line(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    response: &Response,
) -> std::io::Result<()> {
    // Serializing our own wire enum cannot fail.
    let mut line = serde_json::to_vec(response).unwrap_or_default();
    line.push(b'\n');
    write_half.write_all(&line).await
}
