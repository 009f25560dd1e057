//! Host configuration surface
//!
//! The runtime consumes a small read-only slice of the panel's
//! `config.toml`: which plugins to allow or deny, where the user
//! plugin directory lives, the IPC socket path, and lifecycle
//! timeouts. It never writes any of it back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LedgeError;

/// Configuration consumed by the plugin runtime.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub plugins: PluginsConfig,

    #[serde(default)]
    pub ipc: IpcConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Per-plugin settings tables (`[plugin.<id>]` in config.toml),
    /// passed verbatim to each instance through its context.
    #[serde(default, rename = "plugin")]
    pub plugin_settings: HashMap<String, toml::value::Table>,
}

/// Which plugins load, and from where.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Allow-list of plugin identifiers. Empty means "everything that
    /// is not disabled".
    #[serde(default)]
    pub enabled: Vec<String>,

    /// Deny-list. Wins over `enabled`.
    #[serde(default)]
    pub disabled: Vec<String>,

    /// User-writable plugin directory. Defaults to
    /// `<config>/plugins`; mirrored into the cache before loading.
    #[serde(default)]
    pub user_dir: Option<PathBuf>,

    /// Built-in plugin directory shipped with the host. Defaults to
    /// `<data>/plugins`.
    #[serde(default)]
    pub builtin_dir: Option<PathBuf>,

    /// Where user plugins are mirrored before loading. Defaults to
    /// `<cache>/plugins`.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl PluginsConfig {
    /// Whether a plugin identifier passes the enabled/disabled lists.
    pub fn allows(&self, id: &str) -> bool {
        if self.disabled.iter().any(|d| d == id) {
            return false;
        }
        self.enabled.is_empty() || self.enabled.iter().any(|e| e == id)
    }

    /// Effective user plugin directory.
    pub fn user_dir(&self) -> PathBuf {
        self.user_dir
            .clone()
            .unwrap_or_else(|| ledge_paths::config_dir().join("plugins"))
    }

    /// Effective built-in plugin directory.
    pub fn builtin_dir(&self) -> PathBuf {
        self.builtin_dir
            .clone()
            .unwrap_or_else(|| ledge_paths::data_dir().join("plugins"))
    }

    /// Effective mirror directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| ledge_paths::cache_dir().join("plugins"))
    }
}

/// IPC server settings.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Socket path override. Defaults to `<runtime>/ledge.sock`.
    #[serde(default)]
    pub socket: Option<PathBuf>,
}

impl IpcConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket.clone().unwrap_or_else(ledge_paths::socket_path)
    }
}

/// Lifecycle timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// How long an activation/deactivation hook may run before the
    /// instance is marked failed.
    #[serde(default = "default_activation_timeout_secs")]
    pub activation_timeout_secs: u64,

    /// Grace period for cooperative cancellation of an instance's
    /// background tasks before they are detached.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

fn default_activation_timeout_secs() -> u64 {
    10
}

fn default_grace_secs() -> u64 {
    3
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            activation_timeout_secs: default_activation_timeout_secs(),
            grace_secs: default_grace_secs(),
        }
    }
}

impl LifecycleConfig {
    pub fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.activation_timeout_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

impl HostConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file is not an error; it yields the defaults.
    pub fn load(path: &Path) -> Result<Self, LedgeError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| LedgeError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| LedgeError::Config(format!("{}: {e}", path.display())))
    }

    /// Load from the default location (`<config>/config.toml`).
    pub fn load_default() -> Result<Self, LedgeError> {
        Self::load(&ledge_paths::config_dir().join("config.toml"))
    }

    /// Settings table for one plugin, empty if none is configured.
    pub fn settings_for(&self, id: &str) -> Arc<toml::value::Table> {
        Arc::new(self.plugin_settings.get(id).cloned().unwrap_or_default())
    }
}
