//! Publish an event onto a running host's bus

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;

use crate::client::LedgeClient;

#[derive(Args)]
pub struct SendArgs {
    /// Event topic
    pub topic: String,

    /// JSON payload (defaults to an empty object)
    pub payload: Option<String>,

    /// Socket of the host to talk to (defaults to the runtime socket)
    #[arg(long)]
    pub socket: Option<PathBuf>,
}

pub async fn run(args: SendArgs) -> Result<()> {
    let payload: Value = match &args.payload {
        Some(raw) => serde_json::from_str(raw).context("payload is not valid JSON")?,
        None => Value::Object(serde_json::Map::new()),
    };

    let mut client = LedgeClient::connect(args.socket.as_deref()).await?;
    let delivered = client.publish(&args.topic, payload).await?;
    println!("delivered to {delivered} subscriber(s)");
    Ok(())
}
