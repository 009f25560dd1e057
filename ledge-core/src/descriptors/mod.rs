//! Plugin descriptors - static metadata gathered at discovery time
//!
//! A descriptor is pure data: everything the resolver and registry
//! need to know about a plugin before (and without) instantiating it.

pub mod scan;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ledge_plugin_api::PluginMeta;

/// Content fingerprint of a plugin source directory, used to detect
/// change for reload. Derived from modification times, so an in-place
/// rebuild of the library shows up as a new fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint(SystemTime);

impl Fingerprint {
    /// Fingerprint a plugin directory: the newest modification time
    /// anywhere under it, the directory itself included.
    pub fn of_dir(dir: &Path) -> std::io::Result<Self> {
        let mut newest = std::fs::metadata(dir)?.modified()?;
        newest_under(dir, &mut newest)?;
        Ok(Self(newest))
    }

    #[cfg(test)]
    pub(crate) fn at(time: SystemTime) -> Self {
        Self(time)
    }
}

fn newest_under(dir: &Path, newest: &mut SystemTime) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            if modified > *newest {
                *newest = modified;
            }
        }
        let path = entry.path();
        if path.is_dir() {
            newest_under(&path, newest)?;
        }
    }
    Ok(())
}

/// Static metadata describing a plugin before instantiation.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    /// Unique identifier.
    pub id: String,
    /// Opaque placement token for the UI collaborator; `None` for
    /// headless plugins.
    pub placement: Option<String>,
    /// Tie-break within the same placement, lowest first.
    pub order: i32,
    /// Instantiation priority, highest first.
    pub priority: i32,
    /// Identifiers this plugin depends on.
    pub requires: Vec<String>,
    /// Effective enable flag: the metadata flag combined with the
    /// host's enabled/disabled lists.
    pub enabled: bool,
    /// Origin directory (the user's copy for user plugins).
    pub source: PathBuf,
    /// Directory the module is actually loaded from (the cache mirror
    /// for user plugins, the origin itself for built-ins).
    pub load_path: PathBuf,
    /// Fingerprint of `source` at scan time.
    pub fingerprint: Fingerprint,
}

impl PluginDescriptor {
    /// Build a descriptor from module metadata plus scan facts.
    pub fn from_meta(
        meta: &PluginMeta,
        enabled: bool,
        source: PathBuf,
        load_path: PathBuf,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            id: meta.id.clone(),
            placement: meta.placement.clone(),
            order: meta.order,
            priority: meta.priority,
            requires: meta.requires.clone(),
            enabled,
            source,
            load_path,
            fingerprint,
        }
    }
}

/// The set of discovered descriptors, keyed by identifier.
///
/// Pure data; rebuilt on every full rescan and consulted by the
/// resolver. Never persisted.
#[derive(Debug, Default)]
pub struct DescriptorStore {
    descriptors: HashMap<String, PluginDescriptor>,
}

impl DescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a descriptor. Returns the previous one if the
    /// identifier was already present (a user plugin shadowing a
    /// built-in, typically).
    pub fn upsert(&mut self, descriptor: PluginDescriptor) -> Option<PluginDescriptor> {
        self.descriptors.insert(descriptor.id.clone(), descriptor)
    }

    pub fn remove(&mut self, id: &str) -> Option<PluginDescriptor> {
        self.descriptors.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&PluginDescriptor> {
        self.descriptors.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.descriptors.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.descriptors.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn clear(&mut self) {
        self.descriptors.clear();
    }
}

#[cfg(test)]
pub(crate) fn descriptor(id: &str, priority: i32, order: i32, requires: &[&str]) -> PluginDescriptor {
    PluginDescriptor {
        id: id.to_string(),
        placement: None,
        order,
        priority,
        requires: requires.iter().map(|s| s.to_string()).collect(),
        enabled: true,
        source: PathBuf::from(format!("/tmp/{id}")),
        load_path: PathBuf::from(format!("/tmp/{id}")),
        fingerprint: Fingerprint::at(SystemTime::UNIX_EPOCH),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_upsert_replaces_by_id() {
        let mut store = DescriptorStore::new();
        assert!(store.upsert(descriptor("clock", 0, 0, &[])).is_none());
        assert!(store.upsert(descriptor("battery", 0, 0, &[])).is_none());

        let shadowed = store.upsert(descriptor("clock", 5, 0, &[]));
        assert!(shadowed.is_some());
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("clock").unwrap().priority, 5);
    }

    #[test]
    fn test_store_remove() {
        let mut store = DescriptorStore::new();
        store.upsert(descriptor("clock", 0, 0, &[]));
        assert!(store.remove("clock").is_some());
        assert!(store.remove("clock").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_fingerprint_changes_on_touch() {
        let dir = TempDir::new().unwrap();
        let lib = dir.path().join("plugin.so");
        std::fs::write(&lib, b"v1").unwrap();
        let before = Fingerprint::of_dir(dir.path()).unwrap();

        // Push the mtime forward explicitly; fast filesystems can
        // otherwise produce identical timestamps.
        let later = SystemTime::now() + std::time::Duration::from_secs(5);
        let file = std::fs::File::options().write(true).open(&lib).unwrap();
        file.set_modified(later).unwrap();

        let after = Fingerprint::of_dir(dir.path()).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_fingerprint_stable_without_change() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("plugin.so"), b"v1").unwrap();
        let a = Fingerprint::of_dir(dir.path()).unwrap();
        let b = Fingerprint::of_dir(dir.path()).unwrap();
        assert_eq!(a, b);
    }
}
