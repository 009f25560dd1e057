//! Socket client for talking to a running host

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use uuid::Uuid;

use ledge_core::ipc::wire::{Request, Response};

/// One connection to the host's IPC socket.
pub struct LedgeClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl LedgeClient {
    /// Connect to the socket at `path`, or the default runtime socket.
    pub async fn connect(path: Option<&Path>) -> Result<Self> {
        let default = ledge_paths::socket_path();
        let path = path.unwrap_or(&default);
        let stream = UnixStream::connect(path).await.with_context(|| {
            format!(
                "failed to connect to {} - is the host running?",
                path.display()
            )
        })?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        })
    }

    /// Invoke a command and wait for its correlated reply, skipping
    /// any broadcasts that arrive in between.
    pub async fn command(&mut self, name: &str, payload: Value) -> Result<Value> {
        let id = Uuid::new_v4().to_string();
        self.send(&Request::Command {
            name: name.to_string(),
            id: id.clone(),
            payload,
        })
        .await?;

        loop {
            match self.receive().await? {
                Response::Reply { id: reply_id, result } if reply_id == id => {
                    return Ok(result);
                }
                Response::Error {
                    id: error_id,
                    message,
                } if error_id.as_deref() == Some(id.as_str()) || error_id.is_none() => {
                    bail!("{message}");
                }
                _ => continue,
            }
        }
    }

    /// Publish onto the host's event bus and wait for the ack,
    /// returning how many subscribers the event reached.
    pub async fn publish(&mut self, topic: &str, payload: Value) -> Result<u64> {
        let id = Uuid::new_v4().to_string();
        self.send(&Request::Publish {
            topic: topic.to_string(),
            payload,
            id: Some(id.clone()),
        })
        .await?;

        loop {
            match self.receive().await? {
                Response::Reply { id: reply_id, result } if reply_id == id => {
                    return Ok(result
                        .get("delivered")
                        .and_then(Value::as_u64)
                        .unwrap_or(0));
                }
                Response::Error {
                    id: error_id,
                    message,
                } if error_id.as_deref() == Some(id.as_str()) || error_id.is_none() => {
                    bail!("{message}");
                }
                _ => continue,
            }
        }
    }

    async fn send(&mut self, request: &Request) -> Result<()> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .context("failed to write to host socket")?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Response> {
        let line = self
            .lines
            .next_line()
            .await
            .context("failed to read from host socket")?
            .context("host closed the connection")?;
        serde_json::from_str(&line).context("unparseable response from host")
    }
}

/// Shorthand: connect, run one command, disconnect.
pub async fn one_shot(socket: Option<&Path>, name: &str, payload: Value) -> Result<Value> {
    let mut client = LedgeClient::connect(socket).await?;
    client.command(name, payload).await
}

/// Payload helper for commands addressing a single plugin.
pub fn id_payload(id: &str) -> Value {
    json!({ "id": id })
}
