//! In-process event bus
//!
//! Topic-keyed callback fan-out between plugins, plus ungated host
//! taps that see every publish (the IPC server uses one to broadcast
//! events to external clients). Subscription is gated on the
//! subscriber being in the running state; delivery is synchronous and
//! a panicking callback is caught, logged, and skipped.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tracing::{debug, error};

use ledge_plugin_api::{EventCallback, EventSink, SubscribeError};

/// Answers "is this subscriber currently running?". Wired to the
/// registry after construction; the bus itself holds no plugin state.
pub trait RunningGate: Send + Sync {
    fn is_running(&self, subscriber: &str) -> bool;
}

struct Subscription {
    topic: String,
    subscriber: String,
    callback: EventCallback,
}

#[derive(Default)]
struct BusInner {
    subs: Vec<Subscription>,
    taps: Vec<EventCallback>,
}

/// The bus itself. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
    gate: RwLock<Option<Arc<dyn RunningGate>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the running gate. Until one is set, every subscription
    /// attempt is refused.
    pub fn set_gate(&self, gate: Arc<dyn RunningGate>) {
        *self.gate.write().unwrap() = Some(gate);
    }

    /// Subscribe `subscriber` to exact topic `topic`. A repeated
    /// subscription to the same topic replaces the previous callback,
    /// so one publish is delivered at most once per subscriber.
    pub fn subscribe(
        &self,
        topic: &str,
        subscriber: &str,
        callback: EventCallback,
    ) -> Result<(), SubscribeError> {
        let running = self
            .gate
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|g| g.is_running(subscriber));
        if !running {
            return Err(SubscribeError::NotRunning {
                subscriber: subscriber.to_string(),
            });
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .subs
            .iter_mut()
            .find(|s| s.topic == topic && s.subscriber == subscriber)
        {
            existing.callback = callback;
        } else {
            inner.subs.push(Subscription {
                topic: topic.to_string(),
                subscriber: subscriber.to_string(),
                callback,
            });
        }
        debug!(topic, subscriber, "subscribed");
        Ok(())
    }

    /// Deliver `payload` to every subscriber of exactly `topic`, in
    /// subscription order, then to every tap. Returns the number of
    /// subscriber deliveries attempted.
    pub fn publish(&self, topic: &str, payload: &Value) -> usize {
        // Snapshot under the lock, invoke outside it: a callback may
        // publish or subscribe in turn.
        let (callbacks, taps) = {
            let inner = self.inner.lock().unwrap();
            let callbacks: Vec<(String, EventCallback)> = inner
                .subs
                .iter()
                .filter(|s| s.topic == topic)
                .map(|s| (s.subscriber.clone(), s.callback.clone()))
                .collect();
            (callbacks, inner.taps.clone())
        };

        let delivered = callbacks.len();
        for (subscriber, callback) in callbacks {
            let result =
                std::panic::catch_unwind(AssertUnwindSafe(|| callback(topic, payload)));
            if result.is_err() {
                error!(topic, subscriber, "event callback panicked");
            }
        }
        for tap in taps {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| tap(topic, payload)));
            if result.is_err() {
                error!(topic, "event tap panicked");
            }
        }
        delivered
    }

    /// Register an ungated host-side tap that observes every publish.
    pub fn tap(&self, callback: EventCallback) {
        self.inner.lock().unwrap().taps.push(callback);
    }

    /// Drop every subscription held by `subscriber`. Called when an
    /// instance leaves the running state for any reason.
    pub fn unsubscribe_all(&self, subscriber: &str) {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.subs.len();
        inner.subs.retain(|s| s.subscriber != subscriber);
        let removed = before - inner.subs.len();
        if removed > 0 {
            debug!(subscriber, removed, "subscriptions dropped");
        }
    }

    #[cfg(test)]
    fn subscription_count(&self) -> usize {
        self.inner.lock().unwrap().subs.len()
    }
}

/// The per-plugin [`EventSink`] handed out through the host context.
/// Publishes are anonymous on the wire; subscriptions carry the
/// owning plugin's identity for gating and cleanup.
pub struct PluginSink {
    bus: Arc<EventBus>,
    subscriber: String,
}

impl PluginSink {
    pub fn new(bus: Arc<EventBus>, subscriber: impl Into<String>) -> Self {
        Self {
            bus,
            subscriber: subscriber.into(),
        }
    }
}

impl EventSink for PluginSink {
    fn publish(&self, topic: &str, payload: Value) -> usize {
        self.bus.publish(topic, &payload)
    }

    fn subscribe(&self, topic: &str, callback: EventCallback) -> Result<(), SubscribeError> {
        self.bus.subscribe(topic, &self.subscriber, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OpenGate;

    impl RunningGate for OpenGate {
        fn is_running(&self, _subscriber: &str) -> bool {
            true
        }
    }

    struct NamedGate(Vec<&'static str>);

    impl RunningGate for NamedGate {
        fn is_running(&self, subscriber: &str) -> bool {
            self.0.contains(&subscriber)
        }
    }

    fn open_bus() -> Arc<EventBus> {
        let bus = Arc::new(EventBus::new());
        bus.set_gate(Arc::new(OpenGate));
        bus
    }

    fn counter_callback(count: Arc<AtomicUsize>) -> EventCallback {
        Arc::new(move |_topic, _payload| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_exact_topic_delivery() {
        let bus = open_bus();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe("clock/tick", "battery", counter_callback(hits.clone()))
            .unwrap();

        assert_eq!(bus.publish("clock/tick", &serde_json::json!({})), 1);
        assert_eq!(bus.publish("clock/other", &serde_json::json!({})), 0);
        assert_eq!(bus.publish("clock", &serde_json::json!({})), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_requires_running() {
        let bus = Arc::new(EventBus::new());
        bus.set_gate(Arc::new(NamedGate(vec!["alive"])));

        let noop: EventCallback = Arc::new(|_, _| {});
        assert!(bus.subscribe("t", "alive", noop.clone()).is_ok());
        let err = bus.subscribe("t", "dead", noop).unwrap_err();
        assert!(matches!(err, SubscribeError::NotRunning { subscriber } if subscriber == "dead"));
    }

    #[test]
    fn test_subscribe_without_gate_is_refused() {
        let bus = EventBus::new();
        let noop: EventCallback = Arc::new(|_, _| {});
        assert!(bus.subscribe("t", "anyone", noop).is_err());
    }

    #[test]
    fn test_resubscribe_replaces_not_duplicates() {
        let bus = open_bus();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        bus.subscribe("t", "clock", counter_callback(first.clone()))
            .unwrap();
        bus.subscribe("t", "clock", counter_callback(second.clone()))
            .unwrap();

        assert_eq!(bus.publish("t", &serde_json::json!({})), 1);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscription_count(), 1);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let bus = open_bus();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe("t", "bad", Arc::new(|_, _| panic!("boom")))
            .unwrap();
        bus.subscribe("t", "good", counter_callback(hits.clone()))
            .unwrap();

        assert_eq!(bus.publish("t", &serde_json::json!({})), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_all_drops_every_topic() {
        let bus = open_bus();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe("a", "clock", counter_callback(hits.clone()))
            .unwrap();
        bus.subscribe("b", "clock", counter_callback(hits.clone()))
            .unwrap();
        bus.unsubscribe_all("clock");

        bus.publish("a", &serde_json::json!({}));
        bus.publish("b", &serde_json::json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn test_tap_sees_every_publish() {
        let bus = open_bus();
        let taps = Arc::new(AtomicUsize::new(0));
        bus.tap(counter_callback(taps.clone()));

        bus.publish("anything", &serde_json::json!({}));
        bus.publish("else", &serde_json::json!({"n": 1}));
        assert_eq!(taps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_plugin_sink_carries_identity() {
        let bus = Arc::new(EventBus::new());
        bus.set_gate(Arc::new(NamedGate(vec!["clock"])));

        let clock = PluginSink::new(bus.clone(), "clock");
        let battery = PluginSink::new(bus.clone(), "battery");
        let noop: EventCallback = Arc::new(|_, _| {});

        assert!(clock.subscribe("t", noop.clone()).is_ok());
        assert!(battery.subscribe("t", noop).is_err());
    }

    #[test]
    fn test_callback_may_publish_reentrantly() {
        let bus = open_bus();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe("second", "b", counter_callback(hits.clone()))
            .unwrap();

        let inner = bus.clone();
        bus.subscribe(
            "first",
            "a",
            Arc::new(move |_, payload| {
                inner.publish("second", payload);
            }),
        )
        .unwrap();

        bus.publish("first", &serde_json::json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
