//! Clock plugin - a simple example plugin for ledge
//!
//! Demonstrates the plugin contract end to end:
//! - the two capabilities (`meta` and `create`) via `export_plugin!`
//! - a tracked background task publishing events on the bus
//! - handing widget updates to the UI loop through `UiHandle`
//! - reading per-plugin settings from `config.toml`
//!
//! ## Building
//!
//! ```bash
//! cargo build --release
//! ```
//!
//! ## Installing
//!
//! ```bash
//! mkdir -p ~/.config/ledge/plugins/clock
//! cp target/release/libclock_plugin.so ~/.config/ledge/plugins/clock/clock.so
//! ```

use std::time::Duration;

use async_trait::async_trait;
use ledge_plugin_api::{
    HostContext, Plugin, PluginError, PluginMeta, PluginModule, export_plugin,
};
use serde_json::json;
use tracing::info;

const DEFAULT_TICK_SECS: u64 = 1;

#[derive(Default)]
pub struct ClockModule;

impl PluginModule for ClockModule {
    fn meta(&self) -> PluginMeta {
        PluginMeta {
            id: "clock".to_string(),
            placement: Some("center".to_string()),
            order: 0,
            ..Default::default()
        }
    }

    fn create(&self, _host: HostContext) -> Box<dyn Plugin> {
        Box::new(Clock)
    }
}

pub struct Clock;

#[async_trait]
impl Plugin for Clock {
    async fn activate(&mut self, ctx: &HostContext) -> Result<(), PluginError> {
        let tick_secs = ledge_plugin_api::setting_as::<u64>(ctx, "tick_secs")?
            .unwrap_or(DEFAULT_TICK_SECS);
        info!(tick_secs, "clock starting");

        ctx.ui().dispatch(|| {
            // The shell mounts the label widget here.
        });

        let events = ctx.events().clone();
        let ui = ctx.ui().clone();
        let shutdown = ctx.shutdown().clone();
        ctx.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(tick_secs));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = std::time::SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .map(|d| d.as_secs())
                            .unwrap_or(0);
                        events.publish("clock/tick", json!({ "epoch": now }));
                        ui.dispatch(move || {
                            // Update the label text on the UI thread.
                            let _ = now;
                        });
                    }
                }
            }
        });
        Ok(())
    }

    async fn deactivate(&mut self, ctx: &HostContext) -> Result<(), PluginError> {
        info!(plugin = ctx.plugin_id(), "clock stopping");
        ctx.ui().dispatch(|| {
            // Remove the label widget.
        });
        Ok(())
    }
}

export_plugin!(ClockModule);
