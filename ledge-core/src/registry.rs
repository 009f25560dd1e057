//! Plugin registry - live instances and their lifecycle state
//!
//! The registry owns every instantiated plugin, keyed by identifier.
//! State reads never block behind instantiation: structural changes
//! (load, unload, reload) serialize on an async mutex while lookups go
//! through a plain read lock.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use ledge_plugin_api::{HostContext, Plugin, PluginModule, UiHandle, WorkerHandle};

use crate::bus::{EventBus, PluginSink, RunningGate};
use crate::config::HostConfig;
use crate::descriptors::PluginDescriptor;
use crate::error::RegistryError;

/// Lifecycle state of one plugin instance. Transitions are monotonic:
/// an instance never re-enters an earlier state, and `Stopped` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Discovered,
    Validated,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Discovered => "discovered",
            State::Validated => "validated",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
            State::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Stopped | State::Failed)
    }

    fn allows(&self, to: State) -> bool {
        if to == State::Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (State::Discovered, State::Validated)
                | (State::Validated, State::Starting)
                | (State::Starting, State::Running)
                | (State::Running, State::Stopping)
                | (State::Stopping, State::Stopped)
        )
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct StateSlot {
    state: State,
    error: Option<String>,
}

/// One live plugin instance.
pub struct PluginInstance {
    descriptor: PluginDescriptor,
    module: Arc<dyn PluginModule>,
    /// The hook mutex: lifecycle hooks run one at a time per instance.
    plugin: AsyncMutex<Box<dyn Plugin>>,
    state: Mutex<StateSlot>,
    instance_id: Uuid,
    ctx: HostContext,
}

impl PluginInstance {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn module(&self) -> &Arc<dyn PluginModule> {
        &self.module
    }

    /// Identity of this instantiation; a reload that rebuilds the
    /// instance yields a new one.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn state(&self) -> State {
        self.state.lock().unwrap().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().unwrap().error.clone()
    }

    pub fn context(&self) -> &HostContext {
        &self.ctx
    }

    pub(crate) fn plugin(&self) -> &AsyncMutex<Box<dyn Plugin>> {
        &self.plugin
    }

    /// Move to `to`, enforcing the transition table.
    pub(crate) fn transition(&self, to: State) -> Result<(), RegistryError> {
        let mut slot = self.state.lock().unwrap();
        if !slot.state.allows(to) {
            return Err(RegistryError::InvalidTransition {
                plugin: self.descriptor.id.clone(),
                from: slot.state.as_str(),
                to: to.as_str(),
            });
        }
        info!(plugin = %self.descriptor.id, from = %slot.state, to = %to, "state transition");
        slot.state = to;
        Ok(())
    }

    /// Move to `Failed` with a reason. No-op on already-terminal
    /// instances so a late failure cannot resurrect a stopped plugin.
    pub(crate) fn fail(&self, reason: impl Into<String>) {
        let mut slot = self.state.lock().unwrap();
        if slot.state.is_terminal() {
            return;
        }
        let reason = reason.into();
        warn!(plugin = %self.descriptor.id, from = %slot.state, %reason, "instance failed");
        slot.state = State::Failed;
        slot.error = Some(reason);
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.descriptor.id)
            .field("state", &self.state())
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

/// Snapshot of one plugin for listings and IPC replies.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub id: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement: Option<String>,
    pub order: i32,
    pub priority: i32,
    pub requires: Vec<String>,
    pub instance_id: Option<Uuid>,
}

/// Builds a [`HostContext`] per instance from host-wide parts.
#[derive(Clone)]
pub struct ContextBuilder {
    workers: WorkerHandle,
    ui: UiHandle,
    bus: Arc<EventBus>,
    config: Arc<HostConfig>,
}

impl ContextBuilder {
    pub fn new(
        workers: WorkerHandle,
        ui: UiHandle,
        bus: Arc<EventBus>,
        config: Arc<HostConfig>,
    ) -> Self {
        Self {
            workers,
            ui,
            bus,
            config,
        }
    }

    fn build(&self, descriptor: &PluginDescriptor) -> HostContext {
        HostContext::new(
            descriptor.id.clone(),
            descriptor.load_path.clone(),
            self.config.settings_for(&descriptor.id),
            self.workers.clone(),
            self.ui.clone(),
            Arc::new(PluginSink::new(self.bus.clone(), descriptor.id.clone())),
        )
    }
}

struct RegistryInner {
    instances: RwLock<HashMap<String, Arc<PluginInstance>>>,
    /// Plugins that failed before instantiation (contract or resolver
    /// rejections), listed but never retrievable.
    failed: RwLock<HashMap<String, String>>,
    /// Serializes structural changes; never held across state reads.
    structural: AsyncMutex<()>,
}

/// The registry proper.
pub struct PluginRegistry {
    inner: Arc<RegistryInner>,
    ctx_builder: ContextBuilder,
}

impl PluginRegistry {
    pub fn new(ctx_builder: ContextBuilder) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                instances: RwLock::new(HashMap::new()),
                failed: RwLock::new(HashMap::new()),
                structural: AsyncMutex::new(()),
            }),
            ctx_builder,
        }
    }

    /// Instantiate a plugin from its module and register it. The new
    /// instance lands in `Validated`, ready for the lifecycle manager.
    pub async fn load(
        &self,
        descriptor: PluginDescriptor,
        module: Arc<dyn PluginModule>,
    ) -> Result<Arc<PluginInstance>, RegistryError> {
        let _structural = self.inner.structural.lock().await;

        let id = descriptor.id.clone();
        if self.inner.instances.read().unwrap().contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        self.inner.failed.write().unwrap().remove(&id);

        let ctx = self.ctx_builder.build(&descriptor);
        // A panicking factory fails this plugin, nothing else.
        let plugin = {
            let ctx = ctx.clone();
            let module = module.clone();
            std::panic::catch_unwind(AssertUnwindSafe(move || module.create(ctx)))
        };
        let plugin = match plugin {
            Ok(plugin) => plugin,
            Err(_) => {
                let reason = "factory panicked".to_string();
                self.inner
                    .failed
                    .write()
                    .unwrap()
                    .insert(id.clone(), reason.clone());
                warn!(plugin = %id, "factory panicked during instantiation");
                return Err(RegistryError::Contract(
                    crate::error::ContractError::InvalidMetadata(reason),
                ));
            }
        };

        let instance = Arc::new(PluginInstance {
            descriptor,
            module,
            plugin: AsyncMutex::new(plugin),
            state: Mutex::new(StateSlot {
                state: State::Discovered,
                error: None,
            }),
            instance_id: Uuid::new_v4(),
            ctx,
        });
        instance.transition(State::Validated)?;

        self.inner
            .instances
            .write()
            .unwrap()
            .insert(id.clone(), instance.clone());
        info!(plugin = %id, instance = %instance.instance_id, "plugin loaded");
        Ok(instance)
    }

    /// Record a plugin that failed before it could be instantiated.
    /// It shows up in listings as failed; `get` does not return it.
    pub fn record_failure(&self, id: impl Into<String>, reason: impl ToString) {
        let id = id.into();
        self.inner
            .failed
            .write()
            .unwrap()
            .insert(id.clone(), reason.to_string());
        warn!(plugin = %id, "plugin recorded as failed");
    }

    /// Remove an instance. The caller is responsible for having
    /// stopped it first.
    pub async fn remove(&self, id: &str) -> Option<Arc<PluginInstance>> {
        let _structural = self.inner.structural.lock().await;
        self.inner.instances.write().unwrap().remove(id)
    }

    /// Forget a pre-instantiation failure record.
    pub fn clear_failure(&self, id: &str) {
        self.inner.failed.write().unwrap().remove(id);
    }

    /// Forget every pre-instantiation failure record. A rescan calls
    /// this first so records for vanished sources do not linger.
    pub fn clear_failures(&self) {
        self.inner.failed.write().unwrap().clear();
    }

    /// Look up a live instance. Never blocks behind structural
    /// changes.
    pub fn get(&self, id: &str) -> Result<Arc<PluginInstance>, RegistryError> {
        self.inner
            .instances
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Every live instance, unordered.
    pub fn instances(&self) -> Vec<Arc<PluginInstance>> {
        self.inner
            .instances
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect()
    }

    /// Listing of every known plugin, live and pre-instantiation
    /// failures alike, sorted by identifier.
    pub fn list(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> = self
            .instances()
            .into_iter()
            .map(|instance| PluginInfo {
                id: instance.descriptor.id.clone(),
                state: instance.state().as_str().to_string(),
                error: instance.last_error(),
                placement: instance.descriptor.placement.clone(),
                order: instance.descriptor.order,
                priority: instance.descriptor.priority,
                requires: instance.descriptor.requires.clone(),
                instance_id: Some(instance.instance_id),
            })
            .collect();

        for (id, reason) in self.inner.failed.read().unwrap().iter() {
            infos.push(PluginInfo {
                id: id.clone(),
                state: State::Failed.as_str().to_string(),
                error: Some(reason.clone()),
                placement: None,
                order: 0,
                priority: 0,
                requires: Vec::new(),
                instance_id: None,
            });
        }

        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// A gate for the event bus: a subscriber is admitted only while
    /// its instance is running.
    pub fn running_gate(&self) -> Arc<dyn RunningGate> {
        Arc::new(RegistryGate {
            inner: self.inner.clone(),
        })
    }
}

struct RegistryGate {
    inner: Arc<RegistryInner>,
}

impl RunningGate for RegistryGate {
    fn is_running(&self, subscriber: &str) -> bool {
        self.inner
            .instances
            .read()
            .unwrap()
            .get(subscriber)
            .is_some_and(|i| i.state() == State::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::descriptor;
    use async_trait::async_trait;
    use ledge_plugin_api::{PluginError, PluginMeta};

    struct NullPlugin;

    #[async_trait]
    impl Plugin for NullPlugin {
        async fn activate(&mut self, _ctx: &HostContext) -> Result<(), PluginError> {
            Ok(())
        }

        async fn deactivate(&mut self, _ctx: &HostContext) -> Result<(), PluginError> {
            Ok(())
        }
    }

    struct NullModule {
        id: String,
        panic_on_create: bool,
    }

    impl PluginModule for NullModule {
        fn meta(&self) -> PluginMeta {
            PluginMeta {
                id: self.id.clone(),
                ..Default::default()
            }
        }

        fn create(&self, _host: HostContext) -> Box<dyn Plugin> {
            if self.panic_on_create {
                panic!("factory exploded");
            }
            Box::new(NullPlugin)
        }
    }

    fn module(id: &str) -> Arc<dyn PluginModule> {
        Arc::new(NullModule {
            id: id.to_string(),
            panic_on_create: false,
        })
    }

    fn registry() -> PluginRegistry {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let bus = Arc::new(EventBus::new());
        PluginRegistry::new(ContextBuilder::new(
            WorkerHandle::current(),
            UiHandle::new(tx),
            bus,
            Arc::new(HostConfig::default()),
        ))
    }

    #[test]
    fn test_transition_table() {
        assert!(State::Discovered.allows(State::Validated));
        assert!(State::Validated.allows(State::Starting));
        assert!(State::Starting.allows(State::Running));
        assert!(State::Running.allows(State::Stopping));
        assert!(State::Stopping.allows(State::Stopped));

        // No going backwards, no skipping.
        assert!(!State::Running.allows(State::Starting));
        assert!(!State::Validated.allows(State::Running));
        assert!(!State::Stopped.allows(State::Starting));

        // Any live state may fail; terminal states may not.
        assert!(State::Starting.allows(State::Failed));
        assert!(State::Running.allows(State::Failed));
        assert!(!State::Stopped.allows(State::Failed));
        assert!(!State::Failed.allows(State::Failed));
    }

    #[tokio::test]
    async fn test_load_lands_in_validated() {
        let registry = registry();
        let instance = registry
            .load(descriptor("clock", 0, 0, &[]), module("clock"))
            .await
            .unwrap();
        assert_eq!(instance.state(), State::Validated);
        assert_eq!(registry.get("clock").unwrap().instance_id(), instance.instance_id());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let registry = registry();
        registry
            .load(descriptor("clock", 0, 0, &[]), module("clock"))
            .await
            .unwrap();
        let err = registry
            .load(descriptor("clock", 0, 0, &[]), module("clock"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn test_factory_panic_is_contained() {
        let registry = registry();
        let bad: Arc<dyn PluginModule> = Arc::new(NullModule {
            id: "bad".to_string(),
            panic_on_create: true,
        });
        assert!(registry.load(descriptor("bad", 0, 0, &[]), bad).await.is_err());

        // Listed as failed, not retrievable.
        assert!(registry.get("bad").is_err());
        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, "failed");
        assert!(listed[0].instance_id.is_none());

        // A sibling still loads fine afterwards.
        assert!(
            registry
                .load(descriptor("good", 0, 0, &[]), module("good"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_clear_failures_empties_the_side_map() {
        let registry = registry();
        registry.record_failure("broken", "no library found");
        registry.record_failure("worse", "api version mismatch");
        assert_eq!(registry.list().len(), 2);

        registry.clear_failures();
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_transition_refused() {
        let registry = registry();
        let instance = registry
            .load(descriptor("clock", 0, 0, &[]), module("clock"))
            .await
            .unwrap();
        // Validated -> Running skips Starting.
        let err = instance.transition(State::Running).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
        assert_eq!(instance.state(), State::Validated);
    }

    #[tokio::test]
    async fn test_fail_is_sticky_on_terminal() {
        let registry = registry();
        let instance = registry
            .load(descriptor("clock", 0, 0, &[]), module("clock"))
            .await
            .unwrap();
        instance.transition(State::Starting).unwrap();
        instance.transition(State::Running).unwrap();
        instance.transition(State::Stopping).unwrap();
        instance.transition(State::Stopped).unwrap();

        instance.fail("late failure");
        assert_eq!(instance.state(), State::Stopped);
        assert!(instance.last_error().is_none());
    }

    #[tokio::test]
    async fn test_running_gate_tracks_state() {
        let registry = registry();
        let gate = registry.running_gate();
        let instance = registry
            .load(descriptor("clock", 0, 0, &[]), module("clock"))
            .await
            .unwrap();

        assert!(!gate.is_running("clock"));
        instance.transition(State::Starting).unwrap();
        instance.transition(State::Running).unwrap();
        assert!(gate.is_running("clock"));
        instance.fail("oops");
        assert!(!gate.is_running("clock"));
        assert!(!gate.is_running("ghost"));
    }

    #[tokio::test]
    async fn test_reload_yields_new_instance_identity() {
        let registry = registry();
        let first = registry
            .load(descriptor("clock", 0, 0, &[]), module("clock"))
            .await
            .unwrap();
        let first_id = first.instance_id();
        registry.remove("clock").await;

        let second = registry
            .load(descriptor("clock", 0, 0, &[]), module("clock"))
            .await
            .unwrap();
        assert_ne!(first_id, second.instance_id());
    }
}
