//! PanelHost - ties discovery, resolution, lifecycle, events, and IPC
//! together
//!
//! One host per panel process. `startup` performs the initial scan and
//! brings the plugin set up in resolved order, then binds the IPC
//! socket; `resync` re-runs discovery and reconciles the live set
//! against it (used for hot reload); `shutdown` tears everything down
//! in reverse order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use ledge_plugin_api::{PluginModule, WorkerHandle};

use crate::bus::EventBus;
use crate::config::HostConfig;
use crate::descriptors::DescriptorStore;
use crate::descriptors::scan::{ModuleSource, Scanner};
use crate::error::{LedgeError, RegistryError};
use crate::exec::UiLoop;
use crate::ipc::{self, CommandHandler, CommandRegistry, IpcServerHandle};
use crate::lifecycle::LifecycleManager;
use crate::registry::{ContextBuilder, PluginRegistry, State};
use crate::resolve;

/// A widget slot the panel shell still needs to realize: one per
/// running plugin that declared a placement.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WidgetSlot {
    pub plugin: String,
    pub placement: String,
    pub order: i32,
}

/// The panel-side plugin host.
pub struct PanelHost {
    config: Arc<HostConfig>,
    bus: Arc<EventBus>,
    registry: Arc<PluginRegistry>,
    lifecycle: Arc<LifecycleManager>,
    scanner: Scanner,
    store: AsyncMutex<DescriptorStore>,
    /// Resolved instantiation order from the last resync; shutdown
    /// walks it backwards.
    order: Mutex<Vec<String>>,
    ui: Mutex<Option<UiLoop>>,
    ipc: Mutex<Option<IpcServerHandle>>,
}

impl PanelHost {
    /// Build a host. Must be called on the worker runtime; the UI loop
    /// thread starts immediately.
    pub fn new(config: HostConfig, source: Arc<dyn ModuleSource>) -> Arc<Self> {
        let config = Arc::new(config);
        let ui_loop = UiLoop::spawn();
        let bus = Arc::new(EventBus::new());

        let registry = Arc::new(PluginRegistry::new(ContextBuilder::new(
            WorkerHandle::current(),
            ui_loop.handle(),
            bus.clone(),
            config.clone(),
        )));
        bus.set_gate(registry.running_gate());

        let lifecycle = Arc::new(LifecycleManager::new(
            bus.clone(),
            config.lifecycle.clone(),
        ));
        let scanner = Scanner::new(&config.plugins, source);

        Arc::new(Self {
            config,
            bus,
            registry,
            lifecycle,
            scanner,
            store: AsyncMutex::new(DescriptorStore::new()),
            order: Mutex::new(Vec::new()),
            ui: Mutex::new(Some(ui_loop)),
            ipc: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Initial scan plus IPC bind. The bind is the one fatal failure:
    /// everything plugin-side degrades per plugin instead.
    pub async fn startup(self: &Arc<Self>) -> Result<(), LedgeError> {
        self.resync().await?;

        let commands = Arc::new(CommandRegistry::new());
        let host = Arc::downgrade(self);
        commands.register("plugins.list", Arc::new(PluginsListCommand { host: host.clone() }));
        commands.register("plugins.info", Arc::new(PluginsInfoCommand { host: host.clone() }));
        commands.register(
            "plugins.reload",
            Arc::new(PluginsReloadCommand { host: host.clone() }),
        );
        commands.register("widgets.pending", Arc::new(WidgetsPendingCommand { host }));

        let handle = ipc::serve(
            self.config.ipc.socket_path(),
            commands,
            self.bus.clone(),
        )?;
        *self.ipc.lock().unwrap() = Some(handle);

        info!("host started");
        Ok(())
    }

    /// Re-run discovery and reconcile the live plugin set: start what
    /// is new, drop what is gone, reload what changed on disk.
    pub async fn resync(&self) -> Result<(), LedgeError> {
        let outcome = self
            .scanner
            .scan(&self.config.plugins)
            .map_err(|e| LedgeError::Config(format!("plugin scan failed: {e}")))?;

        // Failure records describe the previous scan; rebuild them
        // from this one so a vanished source does not linger as
        // failed (its record is keyed by directory name, which need
        // not match any current metadata id).
        self.registry.clear_failures();

        let mut modules: HashMap<String, Arc<dyn PluginModule>> = HashMap::new();
        let mut store = self.store.lock().await;
        store.clear();
        for discovered in outcome.discovered {
            modules.insert(discovered.descriptor.id.clone(), discovered.module);
            store.upsert(discovered.descriptor);
        }
        for rejected in outcome.rejected {
            self.registry.record_failure(&rejected.id, &rejected.error);
        }

        let resolution = resolve::resolve(&store);
        for (id, error) in &resolution.rejected {
            self.registry.record_failure(id, error);
        }

        // Drop instances whose plugin vanished, was disabled, or fell
        // out of resolution.
        for instance in self.registry.instances() {
            if !resolution.order.iter().any(|id| id == instance.id()) {
                info!(plugin = %instance.id(), "plugin left the resolved set");
                self.lifecycle.stop(&instance).await;
                self.registry.remove(instance.id()).await;
            }
        }

        // Bring the resolved set up in order.
        for id in &resolution.order {
            let descriptor = match store.get(id) {
                Some(d) => d.clone(),
                None => continue,
            };
            let module = match modules.get(id) {
                Some(m) => m.clone(),
                None => continue,
            };

            match self.registry.get(id) {
                Ok(existing) => {
                    if existing.descriptor().fingerprint != descriptor.fingerprint {
                        info!(plugin = %id, "source changed, reloading");
                        self.lifecycle.stop(&existing).await;
                        self.registry.remove(id).await;
                        self.load_and_start(descriptor.clone(), module).await;
                    }
                }
                Err(_) => {
                    self.registry.clear_failure(id);
                    self.load_and_start(descriptor.clone(), module).await;
                }
            }
        }

        *self.order.lock().unwrap() = resolution.order;
        Ok(())
    }

    /// Reload one plugin by identifier. Unchanged sources are a no-op
    /// that keeps the live instance; a changed source is rebuilt as a
    /// fresh instance.
    pub async fn reload_plugin(&self, id: &str) -> Result<ReloadOutcome, LedgeError> {
        let instance = self.registry.get(id).map_err(LedgeError::Registry)?;
        let descriptor = instance.descriptor().clone();

        let refreshed = self
            .scanner
            .refresh(&descriptor, &self.config.plugins)
            .map_err(RegistryError::Contract)
            .map_err(LedgeError::Registry)?;

        match refreshed {
            None => Ok(ReloadOutcome {
                plugin: id.to_string(),
                reloaded: false,
                instance_id: instance.instance_id(),
            }),
            Some(discovered) => {
                self.lifecycle.stop(&instance).await;
                self.registry.remove(id).await;

                let mut store = self.store.lock().await;
                store.upsert(discovered.descriptor.clone());
                drop(store);

                let fresh = self
                    .registry
                    .load(discovered.descriptor, discovered.module)
                    .await
                    .map_err(LedgeError::Registry)?;
                self.lifecycle
                    .start(&self.registry, &fresh)
                    .await
                    .map_err(LedgeError::Registry)?;
                Ok(ReloadOutcome {
                    plugin: id.to_string(),
                    reloaded: true,
                    instance_id: fresh.instance_id(),
                })
            }
        }
    }

    /// Stop one plugin and remove it from the registry. Its
    /// subscriptions and tracked tasks go with it; the descriptor
    /// stays in the store so a later resync can bring it back.
    pub async fn unload_plugin(&self, id: &str) -> Result<(), LedgeError> {
        let instance = self.registry.get(id).map_err(LedgeError::Registry)?;
        self.lifecycle.stop(&instance).await;
        self.registry.remove(id).await;
        self.order.lock().unwrap().retain(|o| o != id);
        info!(plugin = %id, "unloaded");
        Ok(())
    }

    /// Widget slots for every running plugin that declared a
    /// placement, ordered by placement, then `order`, then identifier.
    pub fn pending_widgets(&self) -> Vec<WidgetSlot> {
        let mut slots: Vec<WidgetSlot> = self
            .registry
            .instances()
            .into_iter()
            .filter(|i| i.state() == State::Running)
            .filter_map(|i| {
                i.descriptor().placement.clone().map(|placement| WidgetSlot {
                    plugin: i.id().to_string(),
                    placement,
                    order: i.descriptor().order,
                })
            })
            .collect();
        slots.sort_by(|a, b| {
            a.placement
                .cmp(&b.placement)
                .then(a.order.cmp(&b.order))
                .then(a.plugin.cmp(&b.plugin))
        });
        slots
    }

    /// Stop everything: plugins in reverse instantiation order, then
    /// the IPC server, then the UI loop.
    pub async fn shutdown(&self) {
        let order: Vec<String> = {
            let order = self.order.lock().unwrap();
            order.iter().rev().cloned().collect()
        };
        for id in order {
            if let Ok(instance) = self.registry.get(&id) {
                self.lifecycle.stop(&instance).await;
            }
        }

        if let Some(ipc) = self.ipc.lock().unwrap().take() {
            ipc.stop();
        }
        if let Some(ui) = self.ui.lock().unwrap().take() {
            ui.stop();
        }
        info!("host stopped");
    }

    async fn load_and_start(
        &self,
        descriptor: crate::descriptors::PluginDescriptor,
        module: Arc<dyn PluginModule>,
    ) {
        let id = descriptor.id.clone();
        let instance = match self.registry.load(descriptor, module).await {
            Ok(instance) => instance,
            Err(e) => {
                warn!(plugin = %id, error = %e, "load failed");
                return;
            }
        };
        if let Err(e) = self.lifecycle.start(&self.registry, &instance).await {
            warn!(plugin = %id, error = %e, "start failed");
        }
    }
}

/// Result of an explicit reload request.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadOutcome {
    pub plugin: String,
    pub reloaded: bool,
    pub instance_id: uuid::Uuid,
}

// ─── IPC command handlers ────────────────────────────────────────────

fn upgrade(host: &Weak<PanelHost>) -> Result<Arc<PanelHost>, String> {
    host.upgrade().ok_or_else(|| "host is shutting down".to_string())
}

fn payload_id(payload: &Value) -> Result<String, String> {
    payload
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| "missing 'id' in payload".to_string())
}

struct PluginsListCommand {
    host: Weak<PanelHost>,
}

#[async_trait]
impl CommandHandler for PluginsListCommand {
    async fn handle(&self, _payload: Value) -> Result<Value, String> {
        let host = upgrade(&self.host)?;
        Ok(json!({ "plugins": host.registry.list() }))
    }
}

struct PluginsInfoCommand {
    host: Weak<PanelHost>,
}

#[async_trait]
impl CommandHandler for PluginsInfoCommand {
    async fn handle(&self, payload: Value) -> Result<Value, String> {
        let host = upgrade(&self.host)?;
        let id = payload_id(&payload)?;
        host.registry
            .list()
            .into_iter()
            .find(|info| info.id == id)
            .map(|info| json!(info))
            .ok_or_else(|| format!("plugin not found: {id}"))
    }
}

struct PluginsReloadCommand {
    host: Weak<PanelHost>,
}

#[async_trait]
impl CommandHandler for PluginsReloadCommand {
    async fn handle(&self, payload: Value) -> Result<Value, String> {
        let host = upgrade(&self.host)?;
        let id = payload_id(&payload)?;
        host.reload_plugin(&id)
            .await
            .map(|outcome| json!(outcome))
            .map_err(|e| e.to_string())
    }
}

struct WidgetsPendingCommand {
    host: Weak<PanelHost>,
}

#[async_trait]
impl CommandHandler for WidgetsPendingCommand {
    async fn handle(&self, _payload: Value) -> Result<Value, String> {
        let host = upgrade(&self.host)?;
        Ok(json!({ "widgets": host.pending_widgets() }))
    }
}
