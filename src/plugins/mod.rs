//! Plugin system.
//!
//! - Native modules loaded with libloading, validated by ABI and host version
//! - Dependency-ordered loading with per-plugin config, folder and logger
//! - Plugin callbacks isolated with `catch_unwind`

pub mod api;
pub mod loader;
pub mod manager;
pub mod record;

pub use api::{
    Comparator, Dependency, PluginContext, PluginDeclaration, PluginDescriptor, UserPlugin,
    HOST_API_VERSION, PLUGIN_ABI_VERSION, PLUGIN_SYMBOL,
};
pub use loader::{module_file_name, scan_directory, DiscoveryError, PluginModule};
pub use manager::{LoadReport, PluginManager, PluginPaths, StuckPlugin};
pub use record::{PluginHandle, PluginRecord, PluginState, UnsatisfiedDependency};
