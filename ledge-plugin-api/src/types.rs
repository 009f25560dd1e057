//! Plugin metadata types

use serde::{Deserialize, Serialize};

/// Static metadata a plugin module declares about itself.
///
/// The runtime reads this before any instance exists: it decides
/// whether the plugin loads at all (`enabled`), where its widget goes
/// (`placement` + `order`), when it is instantiated relative to its
/// peers (`priority`), and which other plugins must be running first
/// (`requires`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMeta {
    /// Unique plugin identifier (e.g. "clock", "battery").
    pub id: String,
    /// API version this plugin was built against.
    pub api_version: u32,
    /// Whether the plugin wants to be loaded at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Opaque placement token interpreted by the panel UI
    /// (e.g. "left", "right", "center"). `None` means headless: the
    /// plugin runs in the background and mounts no widget.
    #[serde(default)]
    pub placement: Option<String>,
    /// Tie-break within the same placement, lowest first.
    #[serde(default)]
    pub order: i32,
    /// Instantiation priority, highest first. Hard dependencies always
    /// win over priority.
    #[serde(default)]
    pub priority: i32,
    /// Identifiers of plugins that must be running before this one
    /// starts.
    #[serde(default)]
    pub requires: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for PluginMeta {
    fn default() -> Self {
        Self {
            id: String::new(),
            api_version: crate::API_VERSION,
            enabled: true,
            placement: None,
            order: 0,
            priority: 0,
            requires: Vec::new(),
        }
    }
}

impl PluginMeta {
    /// Whether the plugin mounts a widget on the panel.
    #[must_use]
    pub fn has_placement(&self) -> bool {
        self.placement.is_some()
    }
}
