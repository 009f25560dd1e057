//! Filesystem watcher over the plugin directories
//!
//! Drives hot reload: when anything under a watched directory changes,
//! a single debounced signal is emitted after the burst settles. The
//! host reacts by rescanning; what actually gets reloaded is decided
//! by descriptor fingerprints, not by the events themselves.

use std::path::PathBuf;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::LedgeError;

const RAW_CHANNEL_CAPACITY: usize = 256;

/// A running watcher. Dropping it stops the underlying notify thread;
/// the signal channel closes once the debounce task drains.
pub struct PluginWatcher {
    _watcher: notify::RecommendedWatcher,
}

/// Watch `dirs` (recursively) and emit one signal per settled burst of
/// changes. Directories that do not exist yet are skipped with a log
/// line rather than treated as errors.
pub fn watch(
    dirs: &[PathBuf],
    debounce: Duration,
) -> Result<(PluginWatcher, mpsc::Receiver<()>), LedgeError> {
    let (raw_tx, mut raw_rx) = mpsc::channel::<()>(RAW_CHANNEL_CAPACITY);
    let (signal_tx, signal_rx) = mpsc::channel::<()>(1);

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        match event {
            Ok(event) if event.kind.is_access() => {}
            Ok(_) => {
                // A full channel already has a pending wakeup.
                let _ = raw_tx.try_send(());
            }
            Err(e) => warn!(error = %e, "watch event error"),
        }
    })?;

    for dir in dirs {
        if !dir.exists() {
            debug!(dir = %dir.display(), "not watching missing directory");
            continue;
        }
        watcher.watch(dir, RecursiveMode::Recursive)?;
        debug!(dir = %dir.display(), "watching");
    }

    tokio::spawn(async move {
        while raw_rx.recv().await.is_some() {
            // Coalesce the burst: wait for a quiet period.
            loop {
                match tokio::time::timeout(debounce, raw_rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
            if signal_tx.send(()).await.is_err() {
                break;
            }
        }
        debug!("watch debounce task stopped");
    });

    Ok((PluginWatcher { _watcher: watcher }, signal_rx))
}
