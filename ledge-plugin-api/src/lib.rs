//! ledge-plugin-api - Plugin API for the ledge panel
//!
//! This crate provides the traits and types needed to write plugins
//! for ledge. Plugins are native Rust dynamic libraries discovered at
//! startup; each one exposes two capabilities: a metadata provider
//! ([`PluginModule::meta`]) and a factory ([`PluginModule::create`]).
//!
//! # Example
//!
//! ```ignore
//! use ledge_plugin_api::{
//!     HostContext, Plugin, PluginError, PluginMeta, PluginModule, export_plugin,
//! };
//!
//! #[derive(Default)]
//! pub struct ClockModule;
//!
//! impl PluginModule for ClockModule {
//!     fn meta(&self) -> PluginMeta {
//!         PluginMeta {
//!             id: "clock".to_string(),
//!             placement: Some("center".to_string()),
//!             ..Default::default()
//!         }
//!     }
//!
//!     fn create(&self, host: HostContext) -> Box<dyn Plugin> {
//!         Box::new(Clock { host })
//!     }
//! }
//!
//! pub struct Clock {
//!     host: HostContext,
//! }
//!
//! #[async_trait::async_trait]
//! impl Plugin for Clock {
//!     async fn activate(&mut self, ctx: &HostContext) -> Result<(), PluginError> {
//!         ctx.ui().dispatch(|| { /* mount the widget */ });
//!         Ok(())
//!     }
//!
//!     async fn deactivate(&mut self, _ctx: &HostContext) -> Result<(), PluginError> {
//!         Ok(())
//!     }
//! }
//!
//! export_plugin!(ClockModule);
//! ```

pub mod context;
pub mod error;
pub mod types;

pub use context::{
    EventCallback, EventSink, HostContext, SubscribeError, UiHandle, UiTask, WorkerHandle,
    setting_as,
};
pub use error::PluginError;
pub use types::PluginMeta;

use async_trait::async_trait;

/// Current plugin API version. Plugins must match this exactly; the
/// loader checks it before touching any other symbol.
pub const API_VERSION: u32 = 1;

/// A live plugin instance.
///
/// Both hooks are suspending operations: they may await I/O and spawn
/// sub-tasks through the context, but they run on the worker pool and
/// must hand off through [`HostContext::ui`] before touching panel
/// state.
#[async_trait]
pub trait Plugin: Send {
    /// Bring the plugin up. Runs once per instance; an error or a
    /// timeout marks the instance failed.
    async fn activate(&mut self, ctx: &HostContext) -> Result<(), PluginError>;

    /// Tear the plugin down. Runs on unload, reload, and host
    /// shutdown, after the instance's background tasks were asked to
    /// cancel.
    async fn deactivate(&mut self, ctx: &HostContext) -> Result<(), PluginError>;

    /// Hot-reload hook. The default is a plain deactivate + activate.
    async fn reload(&mut self, ctx: &HostContext) -> Result<(), PluginError> {
        self.deactivate(ctx).await?;
        self.activate(ctx).await
    }
}

/// The contract surface a plugin module must expose.
///
/// The runtime validates both capabilities structurally at load time
/// and rejects the module with a contract error if either is missing,
/// rather than failing at some later call site.
pub trait PluginModule: Send + Sync {
    /// Metadata provider: identifier, enable flag, placement, order,
    /// priority, dependencies.
    fn meta(&self) -> PluginMeta;

    /// Factory provider: construct the live instance. The host-context
    /// handle is the constructor's only argument.
    fn create(&self, host: HostContext) -> Box<dyn Plugin>;
}

/// Export a plugin module for dynamic loading.
///
/// Generates the C ABI entry points the ledge loader looks for:
///
/// - `_ledge_plugin_api_version()`: returns [`API_VERSION`]
/// - `_ledge_plugin_meta()`: the metadata capability
/// - `_ledge_plugin_create(host)`: the factory capability
/// - `_ledge_plugin_destroy(ptr)`: releases an instance
///
/// # Usage
///
/// ```ignore
/// ledge_plugin_api::export_plugin!(ClockModule);
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($module_type:ty) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn _ledge_plugin_api_version() -> u32 {
            $crate::API_VERSION
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _ledge_plugin_meta() -> *mut $crate::PluginMeta {
            let module = <$module_type as ::std::default::Default>::default();
            let meta = $crate::PluginModule::meta(&module);
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(meta))
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _ledge_plugin_create(
            host: *mut $crate::HostContext,
        ) -> *mut dyn $crate::Plugin {
            let host = unsafe { *::std::boxed::Box::from_raw(host) };
            let module = <$module_type as ::std::default::Default>::default();
            let plugin = $crate::PluginModule::create(&module, host);
            ::std::boxed::Box::into_raw(plugin)
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _ledge_plugin_destroy(ptr: *mut dyn $crate::Plugin) {
            if !ptr.is_null() {
                unsafe {
                    drop(::std::boxed::Box::from_raw(ptr));
                }
            }
        }
    };
}
