use libloading::Library;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_yaml::{Mapping, Value};
use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::error;

use super::api::{Dependency, PluginContext, PluginDescriptor, UserPlugin};
use super::loader::{DiscoveryError, PluginModule};
use crate::config::ConfigDocument;
use crate::fault::catch_fault;

/// Shared reference to a plugin record. Records live until shutdown.
pub type PluginHandle = Arc<PluginRecord>;

/// Lifecycle position of a plugin.
///
/// `Loading`, `Enabling` and `Disabling` mark a callback in flight; a second
/// transition requested meanwhile is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Discovered,
    Loading,
    Loaded,
    Enabling,
    Enabled,
    Disabling,
    Disabled,
}

impl PluginState {
    #[must_use]
    pub fn is_loaded(self) -> bool {
        !matches!(self, Self::Discovered | Self::Loading)
    }

    #[must_use]
    pub fn is_enabled(self) -> bool {
        self == Self::Enabled
    }
}

/// A dependency that did not match at discovery time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsatisfiedDependency {
    pub dependency: Dependency,
    /// Version of the plugin that was found under that name, if any.
    pub found: Option<String>,
}

impl fmt::Display for UnsatisfiedDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.found {
            Some(version) => write!(
                f,
                "[{}] but found [{} version={}]",
                self.dependency, self.dependency.name, version
            ),
            None => write!(
                f,
                "[{}]. [{}] is not found",
                self.dependency, self.dependency.name
            ),
        }
    }
}

/// Host-side record of one discovered plugin.
pub struct PluginRecord {
    // Field order matters: the plugin must drop before its library.
    plugin: Box<dyn UserPlugin>,
    descriptor: PluginDescriptor,
    state: Mutex<PluginState>,
    pending_dependencies: AtomicUsize,
    unsatisfied: Mutex<Vec<UnsatisfiedDependency>>,
    config: OnceCell<Arc<ConfigDocument>>,
    folder: OnceCell<PathBuf>,
    source: Option<PathBuf>,
    _library: Option<Library>,
}

impl PluginRecord {
    /// Build a record by asking the module to describe itself.
    ///
    /// # Errors
    /// Returns an error if the descriptor callback panics or reports an
    /// empty name.
    pub fn new(module: PluginModule) -> Result<Self, DiscoveryError> {
        let label = module.label();
        let PluginModule {
            plugin,
            source,
            library,
        } = module;

        let descriptor = catch_fault(|| plugin.description()).map_err(|message| {
            DiscoveryError::DescriptorPanicked {
                module: label.clone(),
                message,
            }
        })?;
        if descriptor.name.trim().is_empty() {
            return Err(DiscoveryError::EmptyName { module: label });
        }

        Ok(Self {
            plugin,
            pending_dependencies: AtomicUsize::new(descriptor.dependencies.len()),
            descriptor,
            state: Mutex::new(PluginState::Discovered),
            unsatisfied: Mutex::new(Vec::new()),
            config: OnceCell::new(),
            folder: OnceCell::new(),
            source,
            _library: library,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.descriptor.version
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.descriptor.description
    }

    #[must_use]
    pub fn author(&self) -> &str {
        &self.descriptor.author
    }

    #[must_use]
    pub fn dependencies(&self) -> &[Dependency] {
        &self.descriptor.dependencies
    }

    #[must_use]
    pub fn soft_dependencies(&self) -> &[Dependency] {
        &self.descriptor.soft_dependencies
    }

    #[must_use]
    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn state(&self) -> PluginState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.state().is_loaded()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state().is_enabled()
    }

    /// Hard dependencies not yet loaded.
    #[must_use]
    pub fn pending_dependencies(&self) -> usize {
        self.pending_dependencies.load(Ordering::SeqCst)
    }

    /// Diagnostics recorded while resolving dependencies.
    #[must_use]
    pub fn unsatisfied_dependencies(&self) -> Vec<UnsatisfiedDependency> {
        self.unsatisfied.lock().clone()
    }

    /// The plugin's configuration document, once loaded.
    #[must_use]
    pub fn config(&self) -> Option<&Arc<ConfigDocument>> {
        self.config.get()
    }

    /// The plugin's resource folder, once loaded.
    #[must_use]
    pub fn folder(&self) -> Option<&Path> {
        self.folder.get().map(PathBuf::as_path)
    }

    /// Module file, `None` for in-process plugins.
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Object exported by the plugin for other plugins.
    #[must_use]
    pub fn plugin_api(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.guarded("plugin_api", || self.plugin.plugin_api())
            .flatten()
    }

    #[must_use]
    pub fn detailed_info(&self) -> String {
        format!(
            "\n\t[Plugin]\n\t\t[Name]: {}\n\t\t[Version]: {}\n\t\t[Author]: {}\n\t\t[Description]: {}\n\t\t[Enabled]: {}\n",
            self.name(),
            self.version(),
            self.author(),
            self.description(),
            self.is_enabled()
        )
    }

    /// Entry stored in the plugin registry document.
    pub(crate) fn registry_snapshot(&self, enable: bool) -> Value {
        let mut snapshot = Mapping::new();
        snapshot.insert("Enable".into(), enable.into());
        snapshot.insert("Version".into(), self.version().into());
        snapshot.insert("Description".into(), self.description().into());
        snapshot.insert("Author".into(), self.author().into());
        snapshot.insert(
            "Dependencies".into(),
            serde_yaml::to_value(self.dependencies()).unwrap_or_default(),
        );
        snapshot.insert(
            "SoftDependencies".into(),
            serde_yaml::to_value(self.soft_dependencies()).unwrap_or_default(),
        );
        Value::Mapping(snapshot)
    }

    /// Move to `to` if the current state is one of `from`.
    pub(crate) fn transition(&self, from: &[PluginState], to: PluginState) -> bool {
        let mut state = self.state.lock();
        if from.contains(&state) {
            *state = to;
            true
        } else {
            false
        }
    }

    pub(crate) fn set_state(&self, to: PluginState) {
        *self.state.lock() = to;
    }

    /// Replace the dependency bookkeeping computed for a load batch.
    pub(crate) fn reset_dependencies(
        &self,
        pending: usize,
        unsatisfied: Vec<UnsatisfiedDependency>,
    ) {
        self.pending_dependencies.store(pending, Ordering::SeqCst);
        *self.unsatisfied.lock() = unsatisfied;
    }

    /// Decrement the pending count, returning what is left.
    pub(crate) fn resolve_dependency(&self) -> usize {
        let previous = self
            .pending_dependencies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub(crate) fn attach(&self, config: Arc<ConfigDocument>, folder: PathBuf) {
        let _ = self.config.set(config);
        let _ = self.folder.set(folder);
    }

    pub(crate) fn invoke_entry_point(&self, context: PluginContext) -> bool {
        self.guarded("entry_point", || self.plugin.entry_point(context))
            .is_some()
    }

    pub(crate) fn invoke_load(&self) -> bool {
        self.guarded("on_load", || self.plugin.on_load())
            .unwrap_or(false)
    }

    pub(crate) fn invoke_enable(&self) -> bool {
        self.guarded("on_enable", || self.plugin.on_enable())
            .unwrap_or(false)
    }

    pub(crate) fn invoke_disable(&self) -> bool {
        self.guarded("on_disable", || self.plugin.on_disable())
            .unwrap_or(false)
    }

    fn guarded<T>(&self, callback: &str, f: impl FnOnce() -> T) -> Option<T> {
        match catch_fault(f) {
            Ok(value) => Some(value),
            Err(message) => {
                error!("Plugin [{self}] panicked in {callback}: {message}");
                None
            }
        }
    }
}

impl fmt::Display for PluginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} version={}", self.name(), self.version())
    }
}

impl fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRecord")
            .field("name", &self.name())
            .field("version", &self.version())
            .field("state", &self.state())
            .field("pending_dependencies", &self.pending_dependencies())
            .finish_non_exhaustive()
    }
}
