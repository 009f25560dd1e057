//! Plugin inspection commands against a running host

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::json;

use crate::client::{id_payload, one_shot};

#[derive(Args)]
pub struct PluginArgs {
    #[command(subcommand)]
    pub command: PluginCommands,

    /// Socket of the host to talk to (defaults to the runtime socket)
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum PluginCommands {
    /// List plugins and their states
    List,
    /// Show one plugin in detail
    Info {
        /// Plugin identifier
        id: String,
    },
    /// Reload a plugin (no-op when its source is unchanged)
    Reload {
        /// Plugin identifier
        id: String,
    },
    /// List widget slots the panel still needs to realize
    Widgets,
}

pub async fn run(args: PluginArgs) -> Result<()> {
    let socket = args.socket.as_deref();
    match args.command {
        PluginCommands::List => {
            let result = one_shot(socket, "plugins.list", json!({})).await?;
            let empty = Vec::new();
            let plugins = result["plugins"].as_array().unwrap_or(&empty);
            if plugins.is_empty() {
                println!("No plugins loaded");
                return Ok(());
            }
            for plugin in plugins {
                let id = plugin["id"].as_str().unwrap_or("?");
                let state = plugin["state"].as_str().unwrap_or("?");
                match plugin["error"].as_str() {
                    Some(error) => println!("{id:<24} {state:<10} {error}"),
                    None => println!("{id:<24} {state}"),
                }
            }
        }
        PluginCommands::Info { id } => {
            let result = one_shot(socket, "plugins.info", id_payload(&id)).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        PluginCommands::Reload { id } => {
            let result = one_shot(socket, "plugins.reload", id_payload(&id)).await?;
            if result["reloaded"].as_bool() == Some(true) {
                println!("Reloaded {id} (new instance {})", result["instance_id"]);
            } else {
                println!("{id} is unchanged, nothing to do");
            }
        }
        PluginCommands::Widgets => {
            let result = one_shot(socket, "widgets.pending", json!({})).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}
