//! ledge-core - the plugin runtime behind the ledge panel
//!
//! The runtime discovers plugin modules on disk, resolves their
//! dependency order, instantiates and drives them through a monotonic
//! lifecycle, fans events out between them, and exposes a Unix-socket
//! control surface. The panel shell itself stays outside: plugins
//! reach the toolkit only through closures dispatched onto the UI
//! loop, and the shell learns which widgets to realize from
//! [`PanelHost::pending_widgets`].
//!
//! The load-bearing rule throughout is isolation: one plugin's
//! failure - a bad library, a panicking hook, a hung activation, an
//! exploding event callback - degrades that plugin alone.

pub mod bus;
pub mod config;
pub mod descriptors;
pub mod error;
pub mod exec;
pub mod host;
pub mod ipc;
pub mod lifecycle;
pub mod registry;
pub mod resolve;
pub mod watch;

pub use bus::{EventBus, PluginSink, RunningGate};
pub use config::HostConfig;
pub use descriptors::{DescriptorStore, PluginDescriptor};
pub use descriptors::scan::{DylibSource, ModuleSource, Scanner, StaticSource};
pub use error::{
    ActivationError, ContractError, IpcError, LedgeError, RegistryError, ResolveError,
};
pub use exec::UiLoop;
pub use host::{PanelHost, ReloadOutcome, WidgetSlot};
pub use ipc::{CommandHandler, CommandRegistry};
pub use lifecycle::LifecycleManager;
pub use registry::{PluginInfo, PluginInstance, PluginRegistry, State};
pub use resolve::{Resolution, resolve};
