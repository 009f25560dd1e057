//! Dependency resolution over plugin descriptors
//!
//! Produces a single instantiation order in which every plugin comes
//! after everything it requires. Among plugins whose dependencies are
//! all satisfied, higher priority goes first; ties break on `order`
//! (lowest first), then identifier. Unresolvable plugins are rejected
//! individually together with their transitive dependents; the rest of
//! the set still resolves.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use tracing::{debug, warn};

use crate::descriptors::DescriptorStore;
use crate::error::ResolveError;

/// Outcome of a resolution pass.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Instantiation order over the accepted plugins.
    pub order: Vec<String>,
    /// Rejected plugins, each with the reason.
    pub rejected: Vec<(String, ResolveError)>,
}

impl Resolution {
    pub fn is_rejected(&self, id: &str) -> bool {
        self.rejected.iter().any(|(r, _)| r == id)
    }
}

/// Key for the ready set. Hard dependencies always dominate; among the
/// ready plugins the heap pops highest priority first, then lowest
/// `order`, then lexicographically smallest identifier.
#[derive(Debug, PartialEq, Eq)]
struct ReadyKey {
    priority: i32,
    order: i32,
    id: String,
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.order.cmp(&self.order))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Resolve an instantiation order over the enabled descriptors in
/// `store`.
pub fn resolve(store: &DescriptorStore) -> Resolution {
    let mut resolution = Resolution::default();

    // Only enabled descriptors participate; a dependency on a disabled
    // or absent plugin is a missing dependency.
    let enabled: HashMap<&str, &crate::descriptors::PluginDescriptor> = store
        .iter()
        .filter(|d| d.enabled)
        .map(|d| (d.id.as_str(), d))
        .collect();

    // First pass: reject plugins with missing dependencies, then
    // propagate rejection to everything that transitively requires
    // them.
    let mut rejected: HashMap<String, ResolveError> = HashMap::new();
    for descriptor in enabled.values() {
        for dep in &descriptor.requires {
            if !enabled.contains_key(dep.as_str()) {
                rejected.insert(
                    descriptor.id.clone(),
                    ResolveError::MissingDependency {
                        plugin: descriptor.id.clone(),
                        dependency: dep.clone(),
                    },
                );
                break;
            }
        }
    }
    propagate_rejections(&enabled, &mut rejected);

    // Kahn's algorithm over the survivors, draining a priority-ordered
    // ready set.
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for descriptor in enabled.values() {
        if rejected.contains_key(&descriptor.id) {
            continue;
        }
        let entry = indegree.entry(descriptor.id.as_str()).or_insert(0);
        *entry += descriptor.requires.len();
        for dep in &descriptor.requires {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(descriptor.id.as_str());
        }
    }

    let mut ready = BinaryHeap::new();
    for (id, degree) in &indegree {
        if *degree == 0 {
            let d = enabled[id];
            ready.push(ReadyKey {
                priority: d.priority,
                order: d.order,
                id: d.id.clone(),
            });
        }
    }

    while let Some(key) = ready.pop() {
        if let Some(next) = dependents.get(key.id.as_str()) {
            for dependent in next {
                let degree = indegree
                    .get_mut(dependent)
                    .filter(|d| **d > 0);
                if let Some(degree) = degree {
                    *degree -= 1;
                    if *degree == 0 {
                        let d = enabled[dependent];
                        ready.push(ReadyKey {
                            priority: d.priority,
                            order: d.order,
                            id: d.id.clone(),
                        });
                    }
                }
            }
        }
        resolution.order.push(key.id);
    }

    // Whatever never reached the ready set sits on a cycle or depends
    // on one. Cycle members are the nodes that can reach themselves
    // within the leftover set.
    let placed: HashSet<&str> = resolution.order.iter().map(String::as_str).collect();
    let leftover: HashSet<&str> = enabled
        .keys()
        .copied()
        .filter(|id| !placed.contains(id) && !rejected.contains_key(*id))
        .collect();

    if !leftover.is_empty() {
        let mut members: Vec<String> = leftover
            .iter()
            .filter(|id| reaches_self(id, &enabled, &leftover))
            .map(|id| id.to_string())
            .collect();
        members.sort();
        warn!(members = ?members, "dependency cycle detected");

        for id in &leftover {
            if members.iter().any(|m| m == id) {
                rejected.insert(
                    id.to_string(),
                    ResolveError::Cycle {
                        members: members.clone(),
                    },
                );
            }
        }
        // Non-members left over depend on the cycle.
        propagate_rejections(&enabled, &mut rejected);
    }

    let mut rejected: Vec<(String, ResolveError)> = rejected.into_iter().collect();
    rejected.sort_by(|a, b| a.0.cmp(&b.0));
    resolution.rejected = rejected;

    debug!(
        accepted = resolution.order.len(),
        rejected = resolution.rejected.len(),
        "resolution complete"
    );
    resolution
}

/// Mark every plugin that transitively requires a rejected plugin as
/// rejected itself. Runs to a fixed point.
fn propagate_rejections(
    enabled: &HashMap<&str, &crate::descriptors::PluginDescriptor>,
    rejected: &mut HashMap<String, ResolveError>,
) {
    loop {
        let mut additions = Vec::new();
        for descriptor in enabled.values() {
            if rejected.contains_key(&descriptor.id) {
                continue;
            }
            if let Some(dep) = descriptor
                .requires
                .iter()
                .find(|dep| rejected.contains_key(*dep))
            {
                additions.push((
                    descriptor.id.clone(),
                    ResolveError::RejectedDependency {
                        plugin: descriptor.id.clone(),
                        dependency: dep.clone(),
                    },
                ));
            }
        }
        if additions.is_empty() {
            break;
        }
        for (id, error) in additions {
            rejected.insert(id, error);
        }
    }
}

/// Whether `start` can reach itself by following `requires` edges
/// inside `within`.
fn reaches_self(
    start: &str,
    enabled: &HashMap<&str, &crate::descriptors::PluginDescriptor>,
    within: &HashSet<&str>,
) -> bool {
    let mut stack: Vec<&str> = enabled[start]
        .requires
        .iter()
        .map(String::as_str)
        .filter(|d| within.contains(d))
        .collect();
    let mut visited = HashSet::new();
    while let Some(id) = stack.pop() {
        if id == start {
            return true;
        }
        if !visited.insert(id) {
            continue;
        }
        if let Some(d) = enabled.get(id) {
            stack.extend(
                d.requires
                    .iter()
                    .map(String::as_str)
                    .filter(|dep| within.contains(dep)),
            );
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::descriptor;

    fn store(descriptors: Vec<crate::descriptors::PluginDescriptor>) -> DescriptorStore {
        let mut store = DescriptorStore::new();
        for d in descriptors {
            store.upsert(d);
        }
        store
    }

    #[test]
    fn test_priority_orders_ready_plugins() {
        let store = store(vec![
            descriptor("a", 1, 0, &[]),
            descriptor("b", 1, 0, &["a"]),
            descriptor("c", 5, 0, &[]),
        ]);
        let resolution = resolve(&store);
        assert_eq!(resolution.order, vec!["c", "a", "b"]);
        assert!(resolution.rejected.is_empty());
    }

    #[test]
    fn test_dependency_dominates_priority() {
        // "high" has the highest priority but requires "low", so it
        // still comes second.
        let store = store(vec![
            descriptor("high", 100, 0, &["low"]),
            descriptor("low", 0, 0, &[]),
            descriptor("mid", 50, 0, &[]),
        ]);
        let resolution = resolve(&store);
        let pos = |id: &str| resolution.order.iter().position(|o| o == id).unwrap();
        assert!(pos("low") < pos("high"));
        assert_eq!(resolution.order[0], "mid");
    }

    #[test]
    fn test_order_breaks_priority_ties() {
        let store = store(vec![
            descriptor("beta", 1, 2, &[]),
            descriptor("alpha", 1, 1, &[]),
            descriptor("gamma", 1, 1, &[]),
        ]);
        let resolution = resolve(&store);
        assert_eq!(resolution.order, vec!["alpha", "gamma", "beta"]);
    }

    #[test]
    fn test_missing_dependency_rejects_plugin_only() {
        let store = store(vec![
            descriptor("clock", 0, 0, &[]),
            descriptor("dockbar", 0, 0, &["compositor"]),
        ]);
        let resolution = resolve(&store);
        assert_eq!(resolution.order, vec!["clock"]);
        assert!(matches!(
            resolution.rejected[0],
            (ref id, ResolveError::MissingDependency { .. }) if id == "dockbar"
        ));
    }

    #[test]
    fn test_disabled_dependency_counts_as_missing() {
        let mut disabled = descriptor("compositor", 0, 0, &[]);
        disabled.enabled = false;
        let store = store(vec![disabled, descriptor("dockbar", 0, 0, &["compositor"])]);
        let resolution = resolve(&store);
        assert!(resolution.order.is_empty());
        assert!(resolution.is_rejected("dockbar"));
    }

    #[test]
    fn test_rejection_propagates_transitively() {
        let store = store(vec![
            descriptor("a", 0, 0, &["ghost"]),
            descriptor("b", 0, 0, &["a"]),
            descriptor("c", 0, 0, &["b"]),
            descriptor("d", 0, 0, &[]),
        ]);
        let resolution = resolve(&store);
        assert_eq!(resolution.order, vec!["d"]);
        assert!(matches!(
            resolution
                .rejected
                .iter()
                .find(|(id, _)| id == "a")
                .map(|(_, e)| e),
            Some(ResolveError::MissingDependency { .. })
        ));
        assert!(matches!(
            resolution
                .rejected
                .iter()
                .find(|(id, _)| id == "c")
                .map(|(_, e)| e),
            Some(ResolveError::RejectedDependency { .. })
        ));
    }

    #[test]
    fn test_cycle_rejects_members_and_dependents_only() {
        let store = store(vec![
            descriptor("x", 0, 0, &["y"]),
            descriptor("y", 0, 0, &["x"]),
            descriptor("z", 0, 0, &["x"]),
            descriptor("clock", 0, 0, &[]),
        ]);
        let resolution = resolve(&store);
        assert_eq!(resolution.order, vec!["clock"]);

        let cycle_err = resolution
            .rejected
            .iter()
            .find(|(id, _)| id == "x")
            .map(|(_, e)| e)
            .unwrap();
        match cycle_err {
            ResolveError::Cycle { members } => {
                assert_eq!(members, &vec!["x".to_string(), "y".to_string()]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(matches!(
            resolution
                .rejected
                .iter()
                .find(|(id, _)| id == "z")
                .map(|(_, e)| e),
            Some(ResolveError::RejectedDependency { .. })
        ));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let store = store(vec![descriptor("narcissus", 0, 0, &["narcissus"])]);
        let resolution = resolve(&store);
        assert!(resolution.order.is_empty());
        assert!(matches!(
            resolution.rejected[0].1,
            ResolveError::Cycle { .. }
        ));
    }

    #[test]
    fn test_deps_always_precede_dependents() {
        let store = store(vec![
            descriptor("a", 3, 0, &[]),
            descriptor("b", 9, 0, &["a"]),
            descriptor("c", 1, 0, &["b"]),
            descriptor("d", 7, 0, &["a", "c"]),
            descriptor("e", 5, 0, &[]),
        ]);
        let resolution = resolve(&store);
        assert_eq!(resolution.order.len(), 5);
        let pos = |id: &str| resolution.order.iter().position(|o| o == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
        assert!(pos("a") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn test_empty_store_resolves_empty() {
        let resolution = resolve(&DescriptorStore::new());
        assert!(resolution.order.is_empty());
        assert!(resolution.rejected.is_empty());
    }
}
