//! Plugin discovery: directory scanning, cache mirroring, and the
//! module-loading seam
//!
//! Plugins live one-per-directory in two locations: the built-in
//! directory shipped with the host and a user-writable directory. The
//! user directory is mirrored into the cache before anything is
//! opened, so editing a plugin in place never corrupts a running
//! instance; the mirror is cleared and repopulated on every full
//! rescan.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use ledge_plugin_api::{API_VERSION, HostContext, Plugin, PluginMeta, PluginModule};

use super::{Fingerprint, PluginDescriptor};
use crate::config::PluginsConfig;
use crate::error::ContractError;

/// How a plugin module is opened from a directory. The production
/// implementation is [`DylibSource`]; tests substitute [`StaticSource`].
pub trait ModuleSource: Send + Sync {
    /// Open the module in `dir` and validate its contract surface:
    /// both required capabilities must be present or the module is
    /// rejected here, not at a later call site.
    fn open(&self, dir: &Path) -> Result<Arc<dyn PluginModule>, ContractError>;
}

/// A discovered, contract-valid plugin: its descriptor plus the open
/// module handle the registry will instantiate from.
pub struct DiscoveredPlugin {
    pub descriptor: PluginDescriptor,
    pub module: Arc<dyn PluginModule>,
}

/// A plugin source that failed contract validation during a scan.
pub struct RejectedPlugin {
    /// Best-known identifier: the directory name.
    pub id: String,
    pub error: ContractError,
}

/// Result of a full scan.
#[derive(Default)]
pub struct ScanOutcome {
    pub discovered: Vec<DiscoveredPlugin>,
    pub rejected: Vec<RejectedPlugin>,
}

// ─── Dynamic library source ──────────────────────────────────────────

type ApiVersionFn = unsafe extern "C" fn() -> u32;
type MetaFn = unsafe extern "C" fn() -> *mut PluginMeta;
type CreateFn = unsafe extern "C" fn(*mut HostContext) -> *mut dyn Plugin;

const SYM_API_VERSION: &[u8] = b"_ledge_plugin_api_version";
const SYM_META: &[u8] = b"_ledge_plugin_meta";
const SYM_CREATE: &[u8] = b"_ledge_plugin_create";

/// Loads plugins as native dynamic libraries via the
/// `export_plugin!` entry points.
pub struct DylibSource;

/// A module backed by a loaded library. The library stays loaded for
/// as long as any instance created from it is alive.
struct DylibModule {
    meta: PluginMeta,
    create_fn: CreateFn,
    // Dropped last; create_fn points into it.
    _library: libloading::Library,
}

impl PluginModule for DylibModule {
    fn meta(&self) -> PluginMeta {
        self.meta.clone()
    }

    fn create(&self, host: HostContext) -> Box<dyn Plugin> {
        let host = Box::into_raw(Box::new(host));
        // SAFETY: the exported factory takes ownership of the context
        // box and returns a Box<dyn Plugin> it created itself.
        unsafe { Box::from_raw((self.create_fn)(host)) }
    }
}

impl ModuleSource for DylibSource {
    fn open(&self, dir: &Path) -> Result<Arc<dyn PluginModule>, ContractError> {
        let lib_path = find_library(dir)?;

        // SAFETY: loading a library the user placed in a plugin
        // directory; it is expected to follow the export_plugin! ABI.
        let library = unsafe { libloading::Library::new(&lib_path)? };

        let api_version: u32 = unsafe {
            let sym: libloading::Symbol<ApiVersionFn> = library
                .get(SYM_API_VERSION)
                .map_err(|_| ContractError::MissingCapability {
                    symbol: "_ledge_plugin_api_version",
                })?;
            sym()
        };
        if api_version != API_VERSION {
            return Err(ContractError::ApiVersionMismatch {
                expected: API_VERSION,
                found: api_version,
            });
        }

        // Validate both capabilities structurally before calling either.
        let meta_fn: MetaFn = unsafe {
            let sym: libloading::Symbol<MetaFn> =
                library
                    .get(SYM_META)
                    .map_err(|_| ContractError::MissingCapability {
                        symbol: "_ledge_plugin_meta",
                    })?;
            *sym
        };
        let create_fn: CreateFn = unsafe {
            let sym: libloading::Symbol<CreateFn> =
                library
                    .get(SYM_CREATE)
                    .map_err(|_| ContractError::MissingCapability {
                        symbol: "_ledge_plugin_create",
                    })?;
            *sym
        };

        // SAFETY: the metadata capability returns a Box<PluginMeta>.
        let meta = unsafe { *Box::from_raw(meta_fn()) };
        if meta.id.is_empty() {
            return Err(ContractError::InvalidMetadata(
                "empty plugin identifier".to_string(),
            ));
        }

        Ok(Arc::new(DylibModule {
            meta,
            create_fn,
            _library: library,
        }))
    }
}

/// Find the plugin library inside a plugin directory: `<name>.so` or
/// `lib<name>.so` (`.dylib` on macOS).
fn find_library(dir: &Path) -> Result<PathBuf, ContractError> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    let extensions: &[&str] = if cfg!(target_os = "macos") {
        &["dylib", "so"]
    } else {
        &["so"]
    };

    for ext in extensions {
        for candidate in [format!("{name}.{ext}"), format!("lib{name}.{ext}")] {
            let lib_path = dir.join(candidate);
            if lib_path.exists() {
                return Ok(lib_path);
            }
        }
    }

    Err(ContractError::LibraryNotFound {
        dir: dir.to_path_buf(),
    })
}

// ─── Static source (in-process modules) ──────────────────────────────

/// A [`ModuleSource`] backed by in-process module objects, keyed by
/// plugin directory name. Used by tests and by hosts embedding
/// built-in plugins without dlopen.
#[derive(Default)]
pub struct StaticSource {
    modules: std::sync::Mutex<std::collections::HashMap<String, Arc<dyn PluginModule>>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under a directory name.
    pub fn register(&self, name: impl Into<String>, module: Arc<dyn PluginModule>) {
        self.modules.lock().unwrap().insert(name.into(), module);
    }
}

impl ModuleSource for StaticSource {
    fn open(&self, dir: &Path) -> Result<Arc<dyn PluginModule>, ContractError> {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        self.modules
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ContractError::LibraryNotFound {
                dir: dir.to_path_buf(),
            })
    }
}

// ─── Scanner ─────────────────────────────────────────────────────────

/// Scans the plugin locations and opens modules through a
/// [`ModuleSource`].
pub struct Scanner {
    source: Arc<dyn ModuleSource>,
    builtin_dir: PathBuf,
    user_dir: PathBuf,
    cache_dir: PathBuf,
}

impl Scanner {
    pub fn new(config: &PluginsConfig, source: Arc<dyn ModuleSource>) -> Self {
        Self {
            source,
            builtin_dir: config.builtin_dir(),
            user_dir: config.user_dir(),
            cache_dir: config.cache_dir(),
        }
    }

    /// Explicit directories, used by tests.
    pub fn with_dirs(
        source: Arc<dyn ModuleSource>,
        builtin_dir: PathBuf,
        user_dir: PathBuf,
        cache_dir: PathBuf,
    ) -> Self {
        Self {
            source,
            builtin_dir,
            user_dir,
            cache_dir,
        }
    }

    /// Full scan: mirror the user directory into the cache, then open
    /// every plugin directory in both locations. User plugins shadow
    /// built-ins with the same identifier. Contract failures are
    /// collected, never fatal.
    pub fn scan(&self, config: &PluginsConfig) -> std::io::Result<ScanOutcome> {
        let mut outcome = ScanOutcome::default();

        self.rebuild_mirror()?;

        for dir in plugin_dirs(&self.builtin_dir)? {
            self.open_into(&mut outcome, config, &dir, &dir);
        }
        for origin in plugin_dirs(&self.user_dir)? {
            let name = dir_name(&origin);
            let mirror = self.cache_dir.join(&name);
            self.open_into(&mut outcome, config, &origin, &mirror);
        }

        info!(
            discovered = outcome.discovered.len(),
            rejected = outcome.rejected.len(),
            "plugin scan complete"
        );
        Ok(outcome)
    }

    /// Refresh one descriptor: returns `None` if the source
    /// fingerprint is unchanged, otherwise re-mirrors (for user
    /// plugins) and re-opens the module.
    pub fn refresh(
        &self,
        descriptor: &PluginDescriptor,
        config: &PluginsConfig,
    ) -> Result<Option<DiscoveredPlugin>, ContractError> {
        let fingerprint = match Fingerprint::of_dir(&descriptor.source) {
            Ok(f) => f,
            Err(e) => {
                // Source directory gone; treat as changed so the
                // caller unloads.
                debug!(plugin = %descriptor.id, error = %e, "source vanished during refresh");
                return Err(ContractError::LibraryNotFound {
                    dir: descriptor.source.clone(),
                });
            }
        };
        if fingerprint == descriptor.fingerprint {
            return Ok(None);
        }

        let load_path = if descriptor.source.starts_with(&self.user_dir) {
            let mirror = self.cache_dir.join(dir_name(&descriptor.source));
            mirror_dir(&descriptor.source, &mirror).map_err(|e| {
                ContractError::InvalidMetadata(format!("mirror failed: {e}"))
            })?;
            mirror
        } else {
            descriptor.source.clone()
        };

        let module = self.source.open(&load_path)?;
        let meta = module.meta();
        let enabled = meta.enabled && config.allows(&meta.id);
        let descriptor = PluginDescriptor::from_meta(
            &meta,
            enabled,
            descriptor.source.clone(),
            load_path,
            fingerprint,
        );
        Ok(Some(DiscoveredPlugin { descriptor, module }))
    }

    fn open_into(
        &self,
        outcome: &mut ScanOutcome,
        config: &PluginsConfig,
        origin: &Path,
        load_path: &Path,
    ) {
        let name = dir_name(origin);
        let fingerprint = match Fingerprint::of_dir(origin) {
            Ok(f) => f,
            Err(e) => {
                warn!(plugin = %name, error = %e, "cannot fingerprint plugin directory");
                return;
            }
        };

        match self.source.open(load_path) {
            Ok(module) => {
                let meta = module.meta();
                if meta.id.is_empty() {
                    outcome.rejected.push(RejectedPlugin {
                        id: name,
                        error: ContractError::InvalidMetadata(
                            "empty plugin identifier".to_string(),
                        ),
                    });
                    return;
                }
                let enabled = meta.enabled && config.allows(&meta.id);
                let descriptor = PluginDescriptor::from_meta(
                    &meta,
                    enabled,
                    origin.to_path_buf(),
                    load_path.to_path_buf(),
                    fingerprint,
                );
                if let Some(shadowed) = outcome
                    .discovered
                    .iter()
                    .position(|d| d.descriptor.id == descriptor.id)
                {
                    info!(plugin = %descriptor.id, "user plugin shadows built-in");
                    outcome.discovered.remove(shadowed);
                }
                outcome.discovered.push(DiscoveredPlugin { descriptor, module });
            }
            Err(error) => {
                warn!(plugin = %name, error = %error, "plugin failed contract validation");
                outcome.rejected.push(RejectedPlugin { id: name, error });
            }
        }
    }

    /// Clear and repopulate the cache mirror of the user directory.
    fn rebuild_mirror(&self) -> std::io::Result<()> {
        if self.cache_dir.exists() {
            std::fs::remove_dir_all(&self.cache_dir)?;
        }
        std::fs::create_dir_all(&self.cache_dir)?;

        for origin in plugin_dirs(&self.user_dir)? {
            let mirror = self.cache_dir.join(dir_name(&origin));
            mirror_dir(&origin, &mirror)?;
        }
        Ok(())
    }
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Immediate subdirectories of a plugin location; a missing location
/// is simply empty.
fn plugin_dirs(base: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if !base.exists() {
        debug!(dir = %base.display(), "plugin directory does not exist");
        return Ok(dirs);
    }
    for entry in std::fs::read_dir(base)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Replace a plugin's mirror with a fresh copy of its directory tree,
/// asset subdirectories included.
fn mirror_dir(origin: &Path, mirror: &Path) -> std::io::Result<()> {
    if mirror.exists() {
        std::fs::remove_dir_all(mirror)?;
    }
    copy_tree(origin, mirror)
}

fn copy_tree(origin: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(origin)? {
        let entry = entry?;
        let path = entry.path();
        let target = dest.join(entry.file_name());
        if path.is_dir() {
            copy_tree(&path, &target)?;
        } else {
            std::fs::copy(&path, &target)?;
        }
    }
    Ok(())
}
