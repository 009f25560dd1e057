//! The host process itself

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tokio::sync::mpsc;
use tracing::{info, warn};

use ledge_core::{DylibSource, HostConfig, PanelHost, watch};

/// Debounce window for plugin directory changes.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Args)]
pub struct RunArgs {
    /// Configuration file (defaults to <config>/config.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Disable hot reload of changed plugin directories
    #[arg(long)]
    pub no_watch: bool,
}

/// A change channel that never fires, for running without the watcher.
/// The sender is kept so `recv` pends instead of closing.
fn idle_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    mpsc::channel(1)
}

pub async fn run(args: RunArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::load_default()?,
    };
    let watch_dirs = vec![config.plugins.builtin_dir(), config.plugins.user_dir()];

    let host = PanelHost::new(config, Arc::new(DylibSource));
    host.startup().await.context("host startup failed")?;

    let mut watcher = None;
    let mut idle = None;
    let mut changes = if args.no_watch {
        let (tx, rx) = idle_channel();
        idle = Some(tx);
        rx
    } else {
        let (w, rx) = watch::watch(&watch_dirs, WATCH_DEBOUNCE)?;
        watcher = Some(w);
        rx
    };

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                info!("shutdown requested");
                break;
            }
            change = changes.recv() => match change {
                Some(()) => {
                    info!("plugin directories changed, resyncing");
                    if let Err(e) = host.resync().await {
                        warn!(error = %e, "resync failed");
                    }
                }
                None => {
                    // Watcher gone; keep serving without hot reload.
                    warn!("plugin watcher stopped");
                    let (tx, rx) = idle_channel();
                    idle = Some(tx);
                    changes = rx;
                }
            },
        }
    }

    drop(watcher);
    drop(idle);
    host.shutdown().await;
    Ok(())
}
