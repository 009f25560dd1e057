//! HostContext - a plugin's interface to the runtime
//!
//! The context bundles everything a plugin instance may touch: its
//! settings, the event sink, and the two execution contexts (worker
//! pool and UI loop). It is handed to the factory at construction and
//! to every lifecycle hook.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::PluginError;

// ─── Event sink ──────────────────────────────────────────────────────

/// Callback invoked for each delivered event: `(topic, payload)`.
pub type EventCallback = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

/// Why a subscription was refused.
#[derive(Error, Debug)]
pub enum SubscribeError {
    /// Only running instances may subscribe; the lifecycle manager
    /// removes subscriptions when an instance leaves Running.
    #[error("subscriber '{subscriber}' is not running")]
    NotRunning { subscriber: String },
}

/// The plugin-facing side of the event bus.
///
/// `publish` never waits for subscriber callbacks; callbacks that do
/// non-trivial work must re-dispatch onto [`WorkerHandle`] or
/// [`UiHandle`] themselves.
pub trait EventSink: Send + Sync {
    /// Publish an event, returning how many subscribers received it.
    fn publish(&self, topic: &str, payload: serde_json::Value) -> usize;

    /// Register a callback for a topic on behalf of this plugin.
    fn subscribe(&self, topic: &str, callback: EventCallback) -> Result<(), SubscribeError>;
}

// ─── Execution contexts ──────────────────────────────────────────────

/// Handle onto the worker pool (the multi-threaded tokio runtime).
///
/// Blocking or CPU-bound work goes through [`WorkerHandle::spawn_blocking`];
/// async work through [`WorkerHandle::spawn`]. Worker code must never
/// touch UI state directly - it hands off through [`UiHandle`].
#[derive(Clone)]
pub struct WorkerHandle {
    handle: tokio::runtime::Handle,
}

impl WorkerHandle {
    /// Wrap an explicit runtime handle.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Capture the runtime the caller is currently on.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }

    /// Spawn a future on the worker pool.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run a blocking closure on the blocking thread pool.
    pub fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.spawn_blocking(f)
    }

    /// The underlying runtime handle.
    pub fn inner(&self) -> &tokio::runtime::Handle {
        &self.handle
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WorkerHandle")
    }
}

/// A unit of work submitted to the UI loop.
pub type UiTask = Box<dyn FnOnce() + Send + 'static>;

/// Handle onto the single-threaded UI loop.
///
/// This is the only way to reach UI state from anywhere else: closures
/// submitted here run on the UI thread, in submission order. The
/// handle is cheap to clone and safe to send across contexts; the UI
/// objects themselves never leave their thread.
#[derive(Clone)]
pub struct UiHandle {
    tx: tokio::sync::mpsc::UnboundedSender<UiTask>,
}

impl UiHandle {
    /// Create a handle feeding the given channel. Constructed by the
    /// host's UI loop; plugins receive it through [`HostContext`].
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<UiTask>) -> Self {
        Self { tx }
    }

    /// Submit a closure to run on the UI thread.
    ///
    /// Returns `false` if the UI loop has already shut down.
    pub fn dispatch(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(f)).is_ok()
    }
}

impl std::fmt::Debug for UiHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UiHandle")
    }
}

// ─── HostContext ─────────────────────────────────────────────────────

/// A plugin instance's handle onto the runtime.
///
/// Cloning is cheap; all clones refer to the same instance-scoped
/// cancellation token and task set, so the lifecycle manager can stop
/// everything the instance started.
#[derive(Clone)]
pub struct HostContext {
    plugin_id: String,
    plugin_dir: PathBuf,
    settings: Arc<toml::value::Table>,
    workers: WorkerHandle,
    ui: UiHandle,
    events: Arc<dyn EventSink>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl HostContext {
    /// Create a context for one plugin instance. Called by the host;
    /// plugin code only ever receives an existing context.
    pub fn new(
        plugin_id: impl Into<String>,
        plugin_dir: PathBuf,
        settings: Arc<toml::value::Table>,
        workers: WorkerHandle,
        ui: UiHandle,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            plugin_dir,
            settings,
            workers,
            ui,
            events,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// The owning plugin's identifier.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Directory the plugin was loaded from (its cache mirror for user
    /// plugins). Plugins may read bundled assets from here.
    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Look up a configuration value for this plugin.
    ///
    /// The table is read-only: the runtime consumes configuration, it
    /// does not own persistence.
    pub fn setting(&self, key: &str) -> Option<&toml::Value> {
        self.settings.get(key)
    }

    /// Convenience string lookup.
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.setting(key).and_then(|v| v.as_str())
    }

    /// The worker pool handle.
    pub fn workers(&self) -> &WorkerHandle {
        &self.workers
    }

    /// The UI loop handle.
    pub fn ui(&self) -> &UiHandle {
        &self.ui
    }

    /// The event sink for publish/subscribe.
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Publish an event on behalf of this plugin.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> usize {
        self.events.publish(topic, payload)
    }

    /// Subscribe this plugin to a topic.
    pub fn subscribe(
        &self,
        topic: &str,
        callback: EventCallback,
    ) -> Result<(), SubscribeError> {
        self.events.subscribe(topic, callback)
    }

    /// Token cancelled when the instance is stopping. Background tasks
    /// must observe it and wind down within the grace period.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Spawn a tracked background task on the worker pool.
    ///
    /// Tracked tasks are cooperatively cancelled on stop: the shutdown
    /// token fires first, then the lifecycle manager waits out the
    /// grace period before detaching whatever is left.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn_on(future, self.workers.inner())
    }

    /// The instance's outstanding-task set. Used by the lifecycle
    /// manager during stop.
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("plugin_id", &self.plugin_id)
            .field("plugin_dir", &self.plugin_dir)
            .field("outstanding_tasks", &self.tasks.len())
            .finish()
    }
}

/// Helper for hooks that want a typed view of a setting.
pub fn setting_as<T: serde::de::DeserializeOwned>(
    ctx: &HostContext,
    key: &str,
) -> Result<Option<T>, PluginError> {
    match ctx.setting(key) {
        None => Ok(None),
        Some(value) => value
            .clone()
            .try_into()
            .map(Some)
            .map_err(|e| PluginError::Config(format!("setting '{key}': {e}"))),
    }
}
