//! XDG Base Directory paths for ledge.
//!
//! Every component resolves its directories through this crate so the
//! layout stays consistent: config and the user plugin directory under
//! `XDG_CONFIG_HOME`, shipped plugins under `XDG_DATA_HOME`, the
//! mirror cache under `XDG_CACHE_HOME`, and the IPC socket under
//! `XDG_RUNTIME_DIR`.

use std::path::PathBuf;

/// Get the ledge config directory.
///
/// Returns `$XDG_CONFIG_HOME/ledge` if set, otherwise `~/.config/ledge`.
/// This is where `config.toml` and the user plugin directory live.
///
/// # Examples
///
/// ```
/// use ledge_paths::config_dir;
///
/// let config = config_dir();
/// let user_plugins = config.join("plugins");
/// ```
pub fn config_dir() -> PathBuf {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config).join("ledge")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".config/ledge")
    } else {
        PathBuf::from(".config/ledge")
    }
}

/// Get the ledge data directory.
///
/// Returns `$XDG_DATA_HOME/ledge` if set, otherwise `~/.local/share/ledge`.
/// Shipped (built-in) plugins are installed under `<data>/plugins`.
pub fn data_dir() -> PathBuf {
    if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg_data).join("ledge")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".local/share/ledge")
    } else {
        PathBuf::from(".local/share/ledge")
    }
}

/// Get the ledge cache directory.
///
/// Returns `$XDG_CACHE_HOME/ledge` if set, otherwise `~/.cache/ledge`.
/// User plugins are mirrored into `<cache>/plugins` before loading so
/// in-place edits never touch a running instance.
pub fn cache_dir() -> PathBuf {
    if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg_cache).join("ledge")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".cache/ledge")
    } else {
        PathBuf::from(".cache/ledge")
    }
}

/// Get the runtime directory for sockets.
///
/// Returns `$XDG_RUNTIME_DIR` if set, otherwise `/tmp`. The IPC server
/// binds `<runtime>/ledge.sock`.
pub fn runtime_dir() -> PathBuf {
    if let Ok(runtime) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime)
    } else {
        PathBuf::from("/tmp")
    }
}

/// Default path of the IPC socket.
pub fn socket_path() -> PathBuf {
    runtime_dir().join("ledge.sock")
}
