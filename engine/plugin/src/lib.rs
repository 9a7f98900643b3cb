//! Dynamic plugin lifecycle: load ordering, dependency resolution and
//! load/unload hook dispatch

mod event;
mod registry;

pub use event::{subscribe, unsubscribe, PluginEvent, SubscriptionId};
pub use registry::{
    begin_plugin_changes, end_plugin_changes, exists_plugin_file,
    initialize_statically_linked_plugins, load_plugin, plugin_infos, register_static_plugin,
    set_max_parallel_instances, unload_all_plugins, unregister_static_plugin, PluginInfo,
    PluginRegistration,
};

use common::*;

bitflags::bitflags! {
    pub struct PluginLoadFlags: u8 {
        /// Load a copy of the binary so the original can be rebuilt in parallel
        const LOAD_COPY = 0b001;
        /// Missing file is a warning, not an error
        const PLUGIN_IS_OPTIONAL = 0b010;
        /// Injected dependency, treated as a tag only
        const CUSTOM_DEPENDENCY = 0b100;
    }
}

impl Default for PluginLoadFlags {
    fn default() -> Self {
        PluginLoadFlags::empty()
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin file not found: {0}")]
    NotFound(String),

    #[error("Plugin {0:?} has no registration symbol: {1}")]
    MissingRegistration(String, String),

    #[error("Cyclic plugin dependency involving {0:?}")]
    DependencyCycle(String),

    #[error("No free copy slot for {0:?} ({1} tried)")]
    NoFreeCopySlot(String, u32),

    #[error("Failed to load plugin {0:?}: {1}")]
    LoadFailed(String, String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PluginResult<T> = Result<T, PluginError>;

/// Declares this crate as a plugin when built as a dynamic library. Expands
/// to the exported registration entry point the loader looks up
#[macro_export]
macro_rules! declare_plugin {
    ($($dep:literal),* ; on_loaded: $loaded:expr, on_unloaded: $unloaded:expr) => {
        #[no_mangle]
        pub fn plugin_registration() -> $crate::PluginRegistration {
            $crate::PluginRegistration {
                dependencies: vec![$($dep.to_owned()),*],
                on_loaded: vec![$loaded],
                on_unloaded: vec![$unloaded],
            }
        }
    };
}
