use std::collections::HashMap;
use std::path::PathBuf;

use common::*;
use libloading::Library;

use crate::event::{broadcast, PluginEvent};
use crate::{PluginError, PluginLoadFlags, PluginResult};

/// What a plugin hands the loader: its dependencies and lifecycle hooks.
/// Dynamic libraries export this through `plugin_registration` (see
/// [declare_plugin](crate::declare_plugin)); statically linked plugins call
/// [register_static_plugin]
#[derive(Default, Clone)]
pub struct PluginRegistration {
    pub dependencies: Vec<String>,
    pub on_loaded: Vec<fn()>,
    pub on_unloaded: Vec<fn()>,
}

#[derive(Clone, Debug)]
pub struct PluginInfo {
    pub name: String,
    pub dependencies: Vec<String>,
    pub flags: PluginLoadFlags,
}

struct LoadedPlugin {
    name: String,
    dependencies: Vec<String>,
    on_unloaded: Vec<fn()>,
    flags: PluginLoadFlags,
    /// None for statically linked plugins
    library: Option<Library>,
    /// Numbered copy to delete on unload
    copied_file: Option<PathBuf>,
}

#[derive(Default)]
struct Registry {
    /// In load order
    loaded: Vec<LoadedPlugin>,
    /// Names currently being loaded, for cycle detection
    loading: Vec<String>,
    statics: HashMap<String, PluginRegistration>,
    statics_initialized: bool,
    change_depth: u32,
    max_parallel_instances: Option<u32>,
}

lazy_static! {
    static ref REGISTRY: parking_lot::Mutex<Registry> =
        parking_lot::Mutex::new(Registry::default());
}

#[cfg(target_os = "windows")]
const DLL_PREFIX: &str = "";
#[cfg(target_os = "windows")]
const DLL_SUFFIX: &str = ".dll";

#[cfg(target_os = "macos")]
const DLL_PREFIX: &str = "lib";
#[cfg(target_os = "macos")]
const DLL_SUFFIX: &str = ".dylib";

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const DLL_PREFIX: &str = "lib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const DLL_SUFFIX: &str = ".so";

fn application_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_owned()))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn plugin_paths(name: &str, copy_number: Option<u32>) -> PathBuf {
    let file = match copy_number {
        None => format!("{}{}{}", DLL_PREFIX, name, DLL_SUFFIX),
        Some(n) => format!("{}{}{}{}", DLL_PREFIX, name, n, DLL_SUFFIX),
    };
    application_dir().join(file)
}

/// Register code that is linked into the executable but behaves like a
/// plugin. Its hooks fire from [initialize_statically_linked_plugins]
pub fn register_static_plugin(name: &str, registration: PluginRegistration) {
    let mut registry = REGISTRY.lock();
    registry.statics.insert(name.to_owned(), registration);
    // a late registration gets picked up by the next initialize call
    registry.statics_initialized = false;
}

/// Removes a static registration again, for hosts tearing down a module
pub fn unregister_static_plugin(name: &str) {
    REGISTRY.lock().statics.remove(name);
}

/// Fires the on-loaded hooks of all statically linked plugins. Called
/// automatically before the first dynamic load
pub fn initialize_statically_linked_plugins() -> PluginResult<()> {
    let names: Vec<String> = {
        let mut registry = REGISTRY.lock();
        if registry.statics_initialized {
            return Ok(());
        }
        registry.statics_initialized = true;
        registry.statics.keys().cloned().collect()
    };

    for name in names {
        load_plugin_inner(&name, PluginLoadFlags::empty())?;
    }

    Ok(())
}

pub fn exists_plugin_file(name: &str) -> bool {
    if REGISTRY.lock().statics.contains_key(name) {
        return true;
    }
    plugin_paths(name, None).exists()
}

pub fn set_max_parallel_instances(count: u32) {
    REGISTRY.lock().max_parallel_instances = Some(count);
}

fn max_parallel_instances() -> u32 {
    if let Some(n) = REGISTRY.lock().max_parallel_instances {
        return n;
    }
    config::get_or_defaults().plugins.max_parallel_instances
}

/// Call before loading/unloading several plugins in a row so dependents see
/// a single BeforePluginChanges/AfterPluginChanges pair
pub fn begin_plugin_changes() {
    let fire = {
        let mut registry = REGISTRY.lock();
        registry.change_depth += 1;
        registry.change_depth == 1
    };

    if fire {
        broadcast(&PluginEvent::BeforePluginChanges);
    }
}

pub fn end_plugin_changes() {
    let fire = {
        let mut registry = REGISTRY.lock();
        debug_assert!(registry.change_depth > 0, "unbalanced plugin changes");
        registry.change_depth = registry.change_depth.saturating_sub(1);
        registry.change_depth == 0
    };

    if fire {
        broadcast(&PluginEvent::AfterPluginChanges);
    }
}

pub fn plugin_infos() -> Vec<PluginInfo> {
    REGISTRY
        .lock()
        .loaded
        .iter()
        .map(|p| PluginInfo {
            name: p.name.clone(),
            dependencies: p.dependencies.clone(),
            flags: p.flags,
        })
        .collect()
}

/// Loads a plugin and all its (transitive) dependencies. Loading an already
/// loaded plugin succeeds without doing anything
pub fn load_plugin(name: &str, flags: PluginLoadFlags) -> PluginResult<()> {
    initialize_statically_linked_plugins()?;
    load_plugin_inner(name, flags)
}

fn load_plugin_inner(name: &str, flags: PluginLoadFlags) -> PluginResult<()> {
    // already loaded or cyclic?
    {
        let mut registry = REGISTRY.lock();
        if registry.loaded.iter().any(|p| p.name == name) {
            return Ok(());
        }
        if registry.loading.iter().any(|n| n == name) {
            return Err(PluginError::DependencyCycle(name.to_owned()));
        }
        registry.loading.push(name.to_owned());
    }

    let result = load_plugin_locked_out(name, flags);

    {
        let mut registry = REGISTRY.lock();
        registry.loading.retain(|n| n != name);
    }

    result
}

/// The loading stack entry for `name` is held by the caller; no registry lock
/// is held while file IO, events and hooks run
fn load_plugin_locked_out(name: &str, flags: PluginLoadFlags) -> PluginResult<()> {
    broadcast(&PluginEvent::BeforeLoading {
        plugin: name.to_owned(),
    });

    let static_registration = REGISTRY.lock().statics.get(name).cloned();

    let (registration, library, copied_file) = match static_registration {
        Some(registration) => (registration, None, None),
        None => {
            let original = plugin_paths(name, None);
            if !original.exists() {
                if flags.contains(PluginLoadFlags::PLUGIN_IS_OPTIONAL) {
                    warn!("optional plugin file not found"; "plugin" => name);
                } else {
                    error!("plugin file not found"; "plugin" => name, "path" => %original.display());
                }
                return Err(PluginError::NotFound(name.to_owned()));
            }

            let (path, copied) = if flags.contains(PluginLoadFlags::LOAD_COPY) {
                let copied = copy_to_free_slot(name, &original)?;
                (copied.clone(), Some(copied))
            } else {
                (original, None)
            };

            let library = unsafe { Library::new(&path) }
                .map_err(|e| PluginError::LoadFailed(name.to_owned(), e.to_string()))?;

            broadcast(&PluginEvent::AfterLoadingBeforeInit {
                plugin: name.to_owned(),
            });

            let registration = unsafe {
                library
                    .get::<unsafe fn() -> PluginRegistration>(b"plugin_registration")
                    .map_err(|e| PluginError::MissingRegistration(name.to_owned(), e.to_string()))?
                    ()
            };

            (registration, Some(library), copied)
        }
    };

    // dependencies load (and fire their hooks) before this plugin's hooks
    for dependency in &registration.dependencies {
        load_plugin_inner(dependency, PluginLoadFlags::empty())?;
    }

    {
        let mut registry = REGISTRY.lock();
        registry.loaded.push(LoadedPlugin {
            name: name.to_owned(),
            dependencies: registration.dependencies.clone(),
            on_unloaded: registration.on_unloaded.clone(),
            flags,
            library,
            copied_file,
        });
    }

    for hook in &registration.on_loaded {
        hook();
    }

    info!("loaded plugin"; "plugin" => name);
    broadcast(&PluginEvent::AfterLoading {
        plugin: name.to_owned(),
    });

    Ok(())
}

fn copy_to_free_slot(name: &str, original: &std::path::Path) -> PluginResult<PathBuf> {
    let max = max_parallel_instances();
    for n in 0..max {
        let candidate = plugin_paths(name, Some(n));
        match std::fs::copy(original, &candidate) {
            Ok(_) => return Ok(candidate),
            Err(_) => continue, // in use by another instance, try the next slot
        }
    }

    Err(PluginError::NoFreeCopySlot(name.to_owned(), max))
}

/// Unloads all plugins in reverse load order
pub fn unload_all_plugins() {
    broadcast(&PluginEvent::StartupShutdown);
    broadcast(&PluginEvent::AfterStartupShutdown);

    let mut plugins = {
        let mut registry = REGISTRY.lock();
        registry.statics_initialized = false;
        std::mem::take(&mut registry.loaded)
    };

    while let Some(mut plugin) = plugins.pop() {
        broadcast(&PluginEvent::BeforeUnloading {
            plugin: plugin.name.clone(),
        });

        for hook in &plugin.on_unloaded {
            hook();
        }

        drop(plugin.library.take());

        if let Some(copied) = &plugin.copied_file {
            if let Err(e) = std::fs::remove_file(copied) {
                warn!("failed to delete plugin copy"; "path" => %copied.display(), "error" => %e);
            }
        }

        info!("unloaded plugin"; "plugin" => &plugin.name);
        broadcast(&PluginEvent::AfterUnloading {
            plugin: plugin.name,
        });
    }
}
