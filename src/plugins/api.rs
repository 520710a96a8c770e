/// Plugin API definitions
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use super::record::{PluginHandle, PluginRecord};
use crate::config::ConfigDocument;
use crate::host::Host;
use crate::logging::PluginLogger;

/// Bumped whenever [`PluginDeclaration`] or [`UserPlugin`] change shape.
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Version of the host crate a plugin was compiled against.
///
/// Plugins exchange Rust trait objects with the host, so both sides must be
/// built from the same `oasis` version with the same toolchain.
pub const HOST_API_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the static every plugin module exports (see [`declare_plugin!`]).
pub const PLUGIN_SYMBOL: &[u8] = b"OASIS_PLUGIN\0";

/// Version comparison operator used by dependencies.
///
/// Versions are compared as plain strings, so `"9" > "10"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessEqual,
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "!=")]
    Unequal,
    #[serde(rename = "*")]
    Any,
}

impl Comparator {
    /// Whether `found` satisfies `found <op> required`.
    #[must_use]
    pub fn compare(self, found: &str, required: &str) -> bool {
        match self {
            Self::Greater => found > required,
            Self::GreaterEqual => found >= required,
            Self::Less => found < required,
            Self::LessEqual => found <= required,
            Self::Equal => found == required,
            Self::Unequal => found != required,
            Self::Any => true,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Greater => ">",
            Self::GreaterEqual => ">=",
            Self::Less => "<",
            Self::LessEqual => "<=",
            Self::Equal => "=",
            Self::Unequal => "!=",
            Self::Any => "*",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dependency on another plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Dependency {
    pub name: String,
    pub version: String,
    pub comparator: Comparator,
}

impl Dependency {
    pub fn new(name: impl Into<String>, comparator: Comparator, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            comparator,
        }
    }

    /// Dependency satisfied by any version.
    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, Comparator::Any, "")
    }

    #[must_use]
    pub fn is_satisfied_by(&self, version: &str) -> bool {
        self.comparator.compare(version, &self.version)
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} version{}{}", self.name, self.comparator, self.version)
    }
}

/// Static description a plugin reports about itself.
#[derive(Debug, Clone, Default)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub dependencies: Vec<Dependency>,
    pub soft_dependencies: Vec<Dependency>,
    /// Seed values for the plugin's own configuration document.
    pub default_config: Mapping,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    #[must_use]
    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    #[must_use]
    pub fn soft_depends_on(mut self, dependency: Dependency) -> Self {
        self.soft_dependencies.push(dependency);
        self
    }

    #[must_use]
    pub fn with_default(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.default_config.insert(Value::from(key), value.into());
        self
    }
}

/// Capability set every plugin implements.
///
/// Callbacks take `&self` and may run on any thread; plugins keep their own
/// state behind interior mutability. The lifecycle callbacks default to
/// succeeding.
pub trait UserPlugin: Send + Sync {
    /// Describe the plugin. Called once at discovery.
    fn description(&self) -> PluginDescriptor;

    /// Receive the host services. Called right before [`UserPlugin::on_load`].
    fn entry_point(&self, context: PluginContext);

    fn on_load(&self) -> bool {
        true
    }

    fn on_enable(&self) -> bool {
        true
    }

    fn on_disable(&self) -> bool {
        true
    }

    /// Optional object other plugins can downcast to talk to this one.
    fn plugin_api(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }
}

/// Services injected into a plugin when it is loaded.
#[derive(Clone)]
pub struct PluginContext {
    plugin: Weak<PluginRecord>,
    host: Weak<Host>,
    logger: PluginLogger,
    config: Arc<ConfigDocument>,
    folder: PathBuf,
}

impl PluginContext {
    pub(crate) fn new(
        plugin: Weak<PluginRecord>,
        host: Weak<Host>,
        logger: PluginLogger,
        config: Arc<ConfigDocument>,
        folder: PathBuf,
    ) -> Self {
        Self {
            plugin,
            host,
            logger,
            config,
            folder,
        }
    }

    /// The host-side record of this plugin.
    #[must_use]
    pub fn plugin(&self) -> Option<PluginHandle> {
        self.plugin.upgrade()
    }

    /// The host, while it is alive.
    #[must_use]
    pub fn host(&self) -> Option<Arc<Host>> {
        self.host.upgrade()
    }

    #[must_use]
    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    /// The plugin's configuration document, seeded with its defaults.
    #[must_use]
    pub fn config(&self) -> &Arc<ConfigDocument> {
        &self.config
    }

    /// Private resource folder of the plugin.
    #[must_use]
    pub fn folder(&self) -> &Path {
        &self.folder
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin", &self.logger.plugin())
            .field("folder", &self.folder)
            .finish_non_exhaustive()
    }
}

/// Exported by every plugin module under [`PLUGIN_SYMBOL`].
///
/// `abi_version` stays the first field so a mismatched module can still be
/// rejected before anything else is read.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PluginDeclaration {
    pub abi_version: u32,
    pub host_version: &'static str,
    pub create: fn() -> Box<dyn UserPlugin>,
}

/// Export a plugin from a `cdylib` crate.
///
/// ```rust,ignore
/// oasis::declare_plugin!(Greeter::default());
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($constructor:expr) => {
        #[doc(hidden)]
        fn __oasis_create_plugin() -> ::std::boxed::Box<dyn $crate::plugins::UserPlugin> {
            ::std::boxed::Box::new($constructor)
        }

        #[no_mangle]
        pub static OASIS_PLUGIN: $crate::plugins::PluginDeclaration =
            $crate::plugins::PluginDeclaration {
                abi_version: $crate::plugins::PLUGIN_ABI_VERSION,
                host_version: $crate::plugins::HOST_API_VERSION,
                create: __oasis_create_plugin,
            };
    };
}
