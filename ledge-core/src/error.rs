//! Error types for ledge-core
//!
//! Failures are always contained to the plugin they came from: a
//! resolver rejection, a contract violation, or a hook failure never
//! propagates to sibling plugins. The one fatal error in the whole
//! runtime is failing to bind the IPC socket.

use thiserror::Error;

use ledge_plugin_api::PluginError;

/// Top-level error type for ledge-core
#[derive(Error, Debug)]
pub enum LedgeError {
    #[error("Resolution error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),

    #[error("Activation error: {0}")]
    Activation(#[from] ActivationError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
}

/// Errors from the dependency resolver. Each one rejects only the
/// descriptors it names; the rest of the set still resolves.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("dependency cycle between plugins: {}", members.join(", "))]
    Cycle { members: Vec<String> },

    #[error("plugin '{plugin}' requires '{dependency}', which is missing or disabled")]
    MissingDependency { plugin: String, dependency: String },

    #[error("plugin '{plugin}' requires '{dependency}', which failed to resolve")]
    RejectedDependency { plugin: String, dependency: String },
}

/// A plugin source failed to expose the required contract surface.
#[derive(Error, Debug)]
pub enum ContractError {
    #[error("no plugin library found in {dir}")]
    LibraryNotFound { dir: std::path::PathBuf },

    #[error("failed to open plugin library: {0}")]
    Open(#[from] libloading::Error),

    #[error("plugin is missing required capability '{symbol}'")]
    MissingCapability { symbol: &'static str },

    #[error("plugin API version mismatch: expected {expected}, found {found}")]
    ApiVersionMismatch { expected: u32, found: u32 },

    #[error("invalid plugin metadata: {0}")]
    InvalidMetadata(String),
}

/// An activation or deactivation hook failed.
#[derive(Error, Debug)]
pub enum ActivationError {
    #[error("hook failed: {0}")]
    Hook(#[from] PluginError),

    #[error("hook did not return within {secs}s")]
    Timeout { secs: u64 },

    #[error("hook panicked")]
    Panicked,

    #[error("dependency '{dependency}' is not running")]
    DependencyNotRunning { dependency: String },
}

/// Errors from registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("duplicate plugin id: {0}")]
    DuplicateId(String),

    #[error("invalid state transition for '{plugin}': {from} -> {to}")]
    InvalidTransition {
        plugin: String,
        from: &'static str,
        to: &'static str,
    },

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Activation(#[from] ActivationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the IPC server.
#[derive(Error, Debug)]
pub enum IpcError {
    /// Socket-level failure. A bind failure is fatal to the host and
    /// surfaced exactly once at startup.
    #[error("IPC transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed wire message; answered on the offending connection
    /// only.
    #[error("IPC protocol error: {0}")]
    Protocol(String),
}
