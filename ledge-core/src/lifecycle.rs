//! Lifecycle manager - starting and stopping plugin instances
//!
//! Hooks run on the worker pool under a timeout; a hook that fails,
//! panics, or overruns fails its own instance and nothing else. Stop
//! is cooperative: the instance's shutdown token fires first, its
//! tracked tasks get the grace period to wind down, and whatever is
//! left is detached and the instance marked failed.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::LifecycleConfig;
use crate::error::{ActivationError, RegistryError};
use crate::registry::{PluginInstance, PluginRegistry, State};

/// How often a starting instance re-checks its dependencies' states.
const DEP_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub struct LifecycleManager {
    bus: Arc<EventBus>,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(bus: Arc<EventBus>, config: LifecycleConfig) -> Self {
        Self { bus, config }
    }

    /// Drive `instance` from `Validated` to `Running`.
    ///
    /// Waits for every required dependency to be running first;
    /// concurrent starts of a dependent and its dependency are safe
    /// because the dependent simply waits. A dependency that has
    /// already failed or stopped fails this instance immediately.
    pub async fn start(
        &self,
        registry: &PluginRegistry,
        instance: &Arc<PluginInstance>,
    ) -> Result<(), RegistryError> {
        let id = instance.id().to_string();

        if let Err(e) = self.await_dependencies(registry, instance).await {
            self.mark_failed(instance, e.to_string());
            return Err(e.into());
        }

        instance.transition(State::Starting)?;
        debug!(plugin = %id, "activating");

        let hook = {
            let instance = instance.clone();
            tokio::spawn(async move {
                let mut plugin = instance.plugin().lock().await;
                plugin.activate(instance.context()).await
            })
        };

        match timeout(self.config.activation_timeout(), hook).await {
            Err(_elapsed) => {
                // The hook keeps the mutex; stop() deals with it later.
                let e = ActivationError::Timeout {
                    secs: self.config.activation_timeout_secs,
                };
                self.mark_failed(instance, e.to_string());
                Err(e.into())
            }
            Ok(Err(join)) => {
                let e = if join.is_panic() {
                    ActivationError::Panicked
                } else {
                    ActivationError::Timeout {
                        secs: self.config.activation_timeout_secs,
                    }
                };
                self.mark_failed(instance, e.to_string());
                Err(e.into())
            }
            Ok(Ok(Err(plugin_err))) => {
                let e = ActivationError::Hook(plugin_err);
                self.mark_failed(instance, e.to_string());
                Err(e.into())
            }
            Ok(Ok(Ok(()))) => {
                instance.transition(State::Running)?;
                info!(plugin = %id, "running");
                Ok(())
            }
        }
    }

    /// Drive `instance` out of service. Idempotent: stopping an
    /// already-terminal instance is a no-op.
    pub async fn stop(&self, instance: &Arc<PluginInstance>) {
        let id = instance.id().to_string();
        let state = instance.state();
        if state.is_terminal() {
            return;
        }

        // From Running this is the orderly path; from any other live
        // state (a start still in flight, or never started) the
        // instance can only end up failed or stay stopped-before-start.
        let orderly = state == State::Running && instance.transition(State::Stopping).is_ok();
        debug!(plugin = %id, orderly, "stopping");

        instance.context().shutdown().cancel();
        self.bus.unsubscribe_all(&id);

        // Grace period for tracked background tasks.
        let tasks = instance.context().tasks();
        tasks.close();
        let tasks_done = timeout(self.config.grace(), tasks.wait()).await.is_ok();
        if !tasks_done {
            warn!(plugin = %id, outstanding = tasks.len(), "tasks detached after grace period");
        }

        if !orderly {
            instance.fail("stopped before reaching running state");
            return;
        }

        // The deactivation hook gets its own grace window. If a hung
        // activation still holds the hook mutex, the lock itself
        // overruns and the instance fails.
        let hook = {
            let instance = instance.clone();
            tokio::spawn(async move {
                let mut plugin = instance.plugin().lock().await;
                plugin.deactivate(instance.context()).await
            })
        };

        let outcome = timeout(self.config.grace(), hook).await;
        match outcome {
            Ok(Ok(Ok(()))) if tasks_done => {
                if instance.transition(State::Stopped).is_ok() {
                    info!(plugin = %id, "stopped");
                }
            }
            Ok(Ok(Ok(()))) => {
                instance.fail("background tasks did not stop within grace period");
            }
            Ok(Ok(Err(e))) => {
                instance.fail(format!("deactivation hook failed: {e}"));
            }
            Ok(Err(join)) if join.is_panic() => {
                instance.fail("deactivation hook panicked");
            }
            Ok(Err(_)) | Err(_) => {
                instance.fail(format!(
                    "deactivation did not complete within {}s",
                    self.config.grace_secs
                ));
            }
        }
    }

    /// Reload hook: deactivate and reactivate in place, keeping the
    /// same instance. Used when the plugin's source is unchanged.
    pub async fn soft_reload(&self, instance: &Arc<PluginInstance>) -> Result<(), RegistryError> {
        if instance.state() != State::Running {
            return Err(RegistryError::InvalidTransition {
                plugin: instance.id().to_string(),
                from: instance.state().as_str(),
                to: "running",
            });
        }

        let hook = {
            let instance = instance.clone();
            tokio::spawn(async move {
                let mut plugin = instance.plugin().lock().await;
                plugin.reload(instance.context()).await
            })
        };

        match timeout(self.config.activation_timeout(), hook).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => {
                let e = ActivationError::Hook(e);
                self.mark_failed(instance, e.to_string());
                Err(e.into())
            }
            Ok(Err(join)) if join.is_panic() => {
                let e = ActivationError::Panicked;
                self.mark_failed(instance, e.to_string());
                Err(e.into())
            }
            _ => {
                let e = ActivationError::Timeout {
                    secs: self.config.activation_timeout_secs,
                };
                self.mark_failed(instance, e.to_string());
                Err(e.into())
            }
        }
    }

    /// Wait until every dependency is running, within the activation
    /// window. A dependency already in a terminal state, or not in the
    /// registry at all, fails fast.
    async fn await_dependencies(
        &self,
        registry: &PluginRegistry,
        instance: &Arc<PluginInstance>,
    ) -> Result<(), ActivationError> {
        let requires = instance.descriptor().requires.clone();
        if requires.is_empty() {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + self.config.activation_timeout();
        for dependency in requires {
            loop {
                match registry.get(&dependency) {
                    Ok(dep) => match dep.state() {
                        State::Running => break,
                        state if state.is_terminal() => {
                            return Err(ActivationError::DependencyNotRunning {
                                dependency,
                            });
                        }
                        _ => {}
                    },
                    Err(_) => {
                        return Err(ActivationError::DependencyNotRunning { dependency });
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(ActivationError::DependencyNotRunning { dependency });
                }
                tokio::time::sleep(DEP_POLL_INTERVAL).await;
            }
        }
        Ok(())
    }

    /// Common failure path: mark failed, drop subscriptions, cancel
    /// the instance's tasks.
    fn mark_failed(&self, instance: &Arc<PluginInstance>, reason: String) {
        instance.fail(reason);
        self.bus.unsubscribe_all(instance.id());
        instance.context().shutdown().cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::descriptors::descriptor;
    use crate::registry::ContextBuilder;
    use async_trait::async_trait;
    use ledge_plugin_api::{
        HostContext, Plugin, PluginError, PluginMeta, PluginModule, UiHandle, WorkerHandle,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Clone, Copy, PartialEq)]
    enum Behavior {
        Ok,
        FailActivate,
        PanicActivate,
        HangActivate,
        FailDeactivate,
    }

    struct TestPlugin {
        behavior: Behavior,
        deactivated: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Plugin for TestPlugin {
        async fn activate(&mut self, _ctx: &HostContext) -> Result<(), PluginError> {
            match self.behavior {
                Behavior::FailActivate => Err(PluginError::custom("refusing to start")),
                Behavior::PanicActivate => panic!("activation blew up"),
                Behavior::HangActivate => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        async fn deactivate(&mut self, _ctx: &HostContext) -> Result<(), PluginError> {
            self.deactivated.store(true, Ordering::SeqCst);
            if self.behavior == Behavior::FailDeactivate {
                return Err(PluginError::custom("refusing to stop"));
            }
            Ok(())
        }
    }

    struct TestModule {
        id: String,
        behavior: Behavior,
        deactivated: Arc<AtomicBool>,
    }

    impl PluginModule for TestModule {
        fn meta(&self) -> PluginMeta {
            PluginMeta {
                id: self.id.clone(),
                ..Default::default()
            }
        }

        fn create(&self, _host: HostContext) -> Box<dyn Plugin> {
            Box::new(TestPlugin {
                behavior: self.behavior,
                deactivated: self.deactivated.clone(),
            })
        }
    }

    struct Fixture {
        registry: PluginRegistry,
        lifecycle: LifecycleManager,
        bus: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let bus = Arc::new(EventBus::new());
        let registry = PluginRegistry::new(ContextBuilder::new(
            WorkerHandle::current(),
            UiHandle::new(tx),
            bus.clone(),
            Arc::new(HostConfig::default()),
        ));
        bus.set_gate(registry.running_gate());
        let lifecycle = LifecycleManager::new(
            bus.clone(),
            LifecycleConfig {
                activation_timeout_secs: 1,
                grace_secs: 1,
            },
        );
        Fixture {
            registry,
            lifecycle,
            bus,
        }
    }

    async fn load(
        f: &Fixture,
        id: &str,
        behavior: Behavior,
        requires: &[&str],
    ) -> (Arc<PluginInstance>, Arc<AtomicBool>) {
        let deactivated = Arc::new(AtomicBool::new(false));
        let module: Arc<dyn PluginModule> = Arc::new(TestModule {
            id: id.to_string(),
            behavior,
            deactivated: deactivated.clone(),
        });
        let instance = f
            .registry
            .load(descriptor(id, 0, 0, requires), module)
            .await
            .unwrap();
        (instance, deactivated)
    }

    #[tokio::test]
    async fn test_start_then_stop_cleanly() {
        let f = fixture();
        let (instance, deactivated) = load(&f, "clock", Behavior::Ok, &[]).await;

        f.lifecycle.start(&f.registry, &instance).await.unwrap();
        assert_eq!(instance.state(), State::Running);

        f.lifecycle.stop(&instance).await;
        assert_eq!(instance.state(), State::Stopped);
        assert!(deactivated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failing_hook_fails_only_its_instance() {
        let f = fixture();
        let (bad, _) = load(&f, "bad", Behavior::FailActivate, &[]).await;
        let (good, _) = load(&f, "good", Behavior::Ok, &[]).await;

        assert!(f.lifecycle.start(&f.registry, &bad).await.is_err());
        f.lifecycle.start(&f.registry, &good).await.unwrap();

        assert_eq!(bad.state(), State::Failed);
        assert!(bad.last_error().unwrap().contains("refusing to start"));
        assert_eq!(good.state(), State::Running);
    }

    #[tokio::test]
    async fn test_panicking_hook_is_contained() {
        let f = fixture();
        let (instance, _) = load(&f, "volatile", Behavior::PanicActivate, &[]).await;

        let err = f.lifecycle.start(&f.registry, &instance).await.unwrap_err();
        assert!(err.to_string().contains("panicked"));
        assert_eq!(instance.state(), State::Failed);
    }

    #[tokio::test]
    async fn test_hung_activation_times_out() {
        let f = fixture();
        let (instance, _) = load(&f, "sleepy", Behavior::HangActivate, &[]).await;

        let err = f.lifecycle.start(&f.registry, &instance).await.unwrap_err();
        assert!(err.to_string().contains("1s"));
        assert_eq!(instance.state(), State::Failed);
    }

    #[tokio::test]
    async fn test_dependency_must_be_running() {
        let f = fixture();
        let (dep, _) = load(&f, "compositor", Behavior::FailActivate, &[]).await;
        let (dependent, _) = load(&f, "dockbar", Behavior::Ok, &["compositor"]).await;

        let _ = f.lifecycle.start(&f.registry, &dep).await;
        let err = f
            .lifecycle
            .start(&f.registry, &dependent)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("compositor"));
        assert_eq!(dependent.state(), State::Failed);
    }

    #[tokio::test]
    async fn test_concurrent_start_waits_for_dependency() {
        let f = Arc::new(fixture());
        let (dep, _) = load(&f, "compositor", Behavior::Ok, &[]).await;
        let (dependent, _) = load(&f, "dockbar", Behavior::Ok, &["compositor"]).await;

        // Start the dependent first; it must wait for the dependency.
        let dependent_task = {
            let f = f.clone();
            let dependent = dependent.clone();
            tokio::spawn(async move { f.lifecycle.start(&f.registry, &dependent).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_ne!(dependent.state(), State::Running);

        f.lifecycle.start(&f.registry, &dep).await.unwrap();
        dependent_task.await.unwrap().unwrap();
        assert_eq!(dependent.state(), State::Running);
    }

    #[tokio::test]
    async fn test_failed_start_drops_subscriptions() {
        let f = fixture();
        let (instance, _) = load(&f, "flaky", Behavior::Ok, &[]).await;
        f.lifecycle.start(&f.registry, &instance).await.unwrap();

        instance
            .context()
            .subscribe("topic", Arc::new(|_, _| {}))
            .unwrap();
        assert_eq!(f.bus.publish("topic", &serde_json::json!({})), 1);

        f.lifecycle.stop(&instance).await;
        assert_eq!(f.bus.publish("topic", &serde_json::json!({})), 0);
    }

    #[tokio::test]
    async fn test_stop_cancels_tracked_tasks() {
        let f = fixture();
        let (instance, _) = load(&f, "worker", Behavior::Ok, &[]).await;
        f.lifecycle.start(&f.registry, &instance).await.unwrap();

        let finished = Arc::new(AtomicBool::new(false));
        {
            let token = instance.context().shutdown().clone();
            let finished = finished.clone();
            instance.context().spawn(async move {
                token.cancelled().await;
                finished.store(true, Ordering::SeqCst);
            });
        }

        f.lifecycle.stop(&instance).await;
        assert_eq!(instance.state(), State::Stopped);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let f = fixture();
        let (instance, deactivated) = load(&f, "clock", Behavior::Ok, &[]).await;
        f.lifecycle.start(&f.registry, &instance).await.unwrap();

        f.lifecycle.stop(&instance).await;
        deactivated.store(false, Ordering::SeqCst);
        f.lifecycle.stop(&instance).await;

        assert_eq!(instance.state(), State::Stopped);
        assert!(!deactivated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failing_deactivation_fails_instance() {
        let f = fixture();
        let (instance, _) = load(&f, "grumpy", Behavior::FailDeactivate, &[]).await;
        f.lifecycle.start(&f.registry, &instance).await.unwrap();

        f.lifecycle.stop(&instance).await;
        assert_eq!(instance.state(), State::Failed);
        assert!(instance.last_error().unwrap().contains("refusing to stop"));
    }

    #[tokio::test]
    async fn test_stop_after_hung_activation_fails_instance() {
        let f = fixture();
        let (instance, _) = load(&f, "sleepy", Behavior::HangActivate, &[]).await;
        let _ = f.lifecycle.start(&f.registry, &instance).await;
        assert_eq!(instance.state(), State::Failed);

        // Already terminal; stop stays a no-op and the state sticks.
        f.lifecycle.stop(&instance).await;
        assert_eq!(instance.state(), State::Failed);
    }

    #[tokio::test]
    async fn test_soft_reload_keeps_instance() {
        let f = fixture();
        let (instance, deactivated) = load(&f, "clock", Behavior::Ok, &[]).await;
        f.lifecycle.start(&f.registry, &instance).await.unwrap();
        let id_before = instance.instance_id();

        f.lifecycle.soft_reload(&instance).await.unwrap();
        assert_eq!(instance.state(), State::Running);
        assert_eq!(instance.instance_id(), id_before);
        // Default reload is deactivate-then-activate.
        assert!(deactivated.load(Ordering::SeqCst));
    }
}
